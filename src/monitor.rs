//! Debug output text helpers.
//!
//! After an update the module can be left running with its debug output
//! streamed to the host. Serial reads chop multi-byte UTF-8 sequences at
//! arbitrary points and mix in line noise, so the stream is accumulated in a
//! byte buffer and drained through these helpers.

/// Drain buffered bytes into displayable UTF-8 text without stalling on
/// invalid bytes.
///
/// Valid UTF-8 is emitted as-is. Invalid byte sequences emit the replacement
/// char `�` and decoding continues. An incomplete UTF-8 suffix is kept in
/// `buffer` so the next read can complete it.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                        output.push_str(valid);
                    }
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('�');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        // Incomplete sequence at the tail; wait for more bytes.
                        if valid_up_to > 0 {
                            buffer.drain(..valid_up_to);
                        }
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Filter non-printable control characters out of debug text.
///
/// Keeps `\n`, `\t` and printable chars, converts `\r` to `\n`, drops the
/// rest.
pub fn clean_debug_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\n' | '\t' => out.push(ch),
            '\r' => out.push('\n'),
            _ if ch.is_control() => {},
            _ => out.push(ch),
        }
    }
    out
}
