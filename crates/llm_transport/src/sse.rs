use serde_json::Value;

/// Incremental decoder for `text/event-stream` bodies.
///
/// Frames end at a blank line. `data:` lines of one frame are joined and parsed
/// as JSON; `[DONE]`, empty and malformed payloads are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// Feed arbitrary bytes into the decoder and drain complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Value> {
        self.buffer.extend(bytes.iter().copied().filter(|byte| *byte != b'\r'));
        let mut events = Vec::new();

        while let Some(split) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..split + 2).collect();
            let frame = String::from_utf8_lossy(&frame[..split]);

            let Some(payload) = extract_data_payload(&frame) else {
                continue;
            };
            if payload == "[DONE]" {
                self.done = true;
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(&payload) {
                events.push(value);
            }
        }

        events
    }

    /// Decode a complete SSE body in one shot.
    pub fn parse_frames(input: &str) -> Vec<Value> {
        let mut decoder = Self::default();
        decoder.feed(input.as_bytes())
    }

    /// True once the `[DONE]` sentinel was seen.
    pub fn saw_done(&self) -> bool {
        self.done
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\n\n")
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .collect();

    let payload = data_lines.join("\n");
    let payload = payload.trim();
    if payload.is_empty() {
        None
    } else {
        Some(payload.to_owned())
    }
}
