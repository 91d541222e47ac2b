/// Splits a byte stream into complete top-level JSON values (objects or
/// arrays), tracking brace/bracket nesting depth and string literals so
/// that `}`/`{` occurring inside a quoted string never count toward depth.
///
/// This exists because neither the subprocess adapter nor the HTTP-stream
/// adapter can assume a backend writes one JSON-RPC frame per line: a
/// single `read()` may return half a frame, several frames back to back,
/// or a multi-megabyte frame spread across dozens of reads. `push` is the
/// only entry point and is safe to call with arbitrarily-sized chunks,
/// including zero-length ones.
#[derive(Default)]
pub struct JsonObjectSplitter {
    buffer: Vec<u8>,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl JsonObjectSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `chunk` into the splitter and returns every top-level value
    /// that became complete as a result, in the order they closed. Bytes
    /// belonging to a still-incomplete value are retained internally and
    /// will be returned (combined with future input) by a later call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut completed = Vec::new();

        for &byte in chunk {
            if self.depth == 0 {
                if byte.is_ascii_whitespace() {
                    continue;
                }
                if byte != b'{' && byte != b'[' {
                    // Stray byte between frames (e.g. a backend's own
                    // diagnostic print leaking onto the wire) — drop it
                    // rather than let it corrupt the next real frame.
                    continue;
                }
                self.buffer.clear();
            }

            self.buffer.push(byte);

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        completed.push(std::mem::take(&mut self.buffer));
                    }
                }
                _ => {}
            }
        }

        completed
    }

    /// Bytes accumulated so far for a value that hasn't closed yet.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_one_object_delivered_whole() {
        let mut s = JsonObjectSplitter::new();
        let out = s.push(br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
        assert_eq!(out.len(), 1);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&out[0]).unwrap()["method"],
            "tools/list"
        );
    }

    #[test]
    fn reassembles_an_object_split_across_many_chunks() {
        let mut s = JsonObjectSplitter::new();
        let whole = br#"{"jsonrpc":"2.0","id":2,"result":{"ok":true}}"#;
        let mut out = Vec::new();
        for byte in whole {
            out.extend(s.push(std::slice::from_ref(byte)));
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], whole);
    }

    #[test]
    fn handles_two_objects_back_to_back_with_no_separator() {
        let mut s = JsonObjectSplitter::new();
        let out = s.push(br#"{"a":1}{"b":2}"#);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], br#"{"a":1}"#);
        assert_eq!(out[1], br#"{"b":2}"#);
    }

    #[test]
    fn ignores_braces_inside_string_literals() {
        let mut s = JsonObjectSplitter::new();
        let whole = br#"{"method":"say {hi} to [them]"}"#;
        let out = s.push(whole);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], whole);
    }

    #[test]
    fn handles_escaped_quotes_inside_strings() {
        let mut s = JsonObjectSplitter::new();
        let whole = br#"{"text":"she said \"hi\""}"#;
        let out = s.push(whole);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], whole);
    }

    #[test]
    fn tolerates_whitespace_and_newlines_between_objects() {
        let mut s = JsonObjectSplitter::new();
        let out = s.push(b"{\"a\":1}\n\n  {\"b\":2}\r\n");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn handles_a_large_payload_spread_across_small_chunks() {
        let mut s = JsonObjectSplitter::new();
        let filler = "x".repeat(100_000);
        let whole = format!(r#"{{"data":"{filler}"}}"#);
        let bytes = whole.as_bytes();

        let mut out = Vec::new();
        for chunk in bytes.chunks(777) {
            out.extend(s.push(chunk));
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], bytes);
    }

    #[test]
    fn a_chunk_boundary_falling_inside_an_escape_sequence_is_handled() {
        let mut s = JsonObjectSplitter::new();
        let whole = br#"{"text":"a\"b"}"#;
        // Split right after the backslash, before the escaped quote.
        let split_at = whole.iter().position(|&b| b == b'\\').unwrap() + 1;
        let mut out = s.push(&whole[..split_at]);
        out.extend(s.push(&whole[split_at..]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], whole);
    }

    #[test]
    fn empty_chunks_are_harmless() {
        let mut s = JsonObjectSplitter::new();
        assert!(s.push(b"").is_empty());
        let out = s.push(br#"{"a":1}"#);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn two_frames_glued_with_a_literal_brace_pair_inside_a_string() {
        let whole = br#"{"jsonrpc":"2.0","id":1,"result":{"text":"hello}{world"}}{"jsonrpc":"2.0","id":2,"method":"notifications/test","params":{"ok":true}}"#;
        let (first, second) = whole.split_at(7);
        let (second, third) = second.split_at(16);

        let mut s = JsonObjectSplitter::new();
        let mut out = Vec::new();
        out.extend(s.push(first));
        out.extend(s.push(second));
        out.extend(s.push(third));

        assert_eq!(out.len(), 2);
        let first_value: serde_json::Value = serde_json::from_slice(&out[0]).unwrap();
        let second_value: serde_json::Value = serde_json::from_slice(&out[1]).unwrap();
        assert_eq!(first_value["id"], 1);
        assert_eq!(first_value["result"]["text"], "hello}{world");
        assert_eq!(second_value["id"], 2);
        assert_eq!(second_value["method"], "notifications/test");
    }
}
