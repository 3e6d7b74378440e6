use bytes::Bytes;

/// One parsed server-sent event: optional `event:` name plus joined `data:` lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Feed byte chunks as they arrive; completed events
/// come back in arrival order. Partial lines stay buffered until the next push.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut out);
        }

        out
    }

    /// Flush whatever is left at end of stream, including an unterminated line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut out);
        }
        self.flush_event(&mut out);
        out
    }

    fn consume_line(&mut self, line: &str, out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.flush_event(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event_name = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_event(&mut self, out: &mut Vec<SseEvent>) {
        if self.event_name.is_none() && self.data_lines.is_empty() {
            return;
        }
        out.push(SseEvent {
            event: self.event_name.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

/// Decoder for upstream streaming bodies whose framing is not known up front.
/// Sniffs the first non-whitespace bytes and locks into SSE, newline-delimited
/// JSON, or a streamed JSON array, then yields raw JSON payload strings.
#[derive(Debug)]
pub struct WireDecoder {
    mode: DecoderMode,
    pending: String,
}

#[derive(Debug)]
enum DecoderMode {
    Undetected,
    Sse(SseParser),
    Ndjson(String),
    JsonArray(ArrayScanner),
}

impl Default for WireDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl WireDecoder {
    pub fn new() -> Self {
        Self {
            mode: DecoderMode::Undetected,
            pending: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };

        match &mut self.mode {
            DecoderMode::Undetected => {
                self.pending.push_str(text);
                let head = self.pending.chars().find(|c| !c.is_whitespace());
                match head {
                    Some('[') => {
                        let mut scanner = ArrayScanner::new();
                        let out = scanner.push(&self.pending);
                        self.mode = DecoderMode::JsonArray(scanner);
                        self.pending.clear();
                        out
                    }
                    Some('{') => {
                        let mut buffer = std::mem::take(&mut self.pending);
                        let out = drain_lines(&mut buffer);
                        self.mode = DecoderMode::Ndjson(buffer);
                        out
                    }
                    Some(_) => {
                        let mut parser = SseParser::new();
                        let events = parser.push_str(&self.pending);
                        self.mode = DecoderMode::Sse(parser);
                        self.pending.clear();
                        sse_data(events)
                    }
                    None => Vec::new(),
                }
            }
            DecoderMode::Sse(parser) => sse_data(parser.push_str(text)),
            DecoderMode::Ndjson(buffer) => {
                buffer.push_str(text);
                drain_lines(buffer)
            }
            DecoderMode::JsonArray(scanner) => scanner.push(text),
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        match &mut self.mode {
            DecoderMode::Undetected => {
                let rest = self.pending.trim();
                if rest.is_empty() {
                    Vec::new()
                } else {
                    vec![rest.to_string()]
                }
            }
            DecoderMode::Sse(parser) => sse_data(parser.finish()),
            DecoderMode::Ndjson(buffer) => {
                let mut out = drain_lines(buffer);
                let rest = buffer.trim();
                if !rest.is_empty() {
                    out.push(rest.to_string());
                }
                buffer.clear();
                out
            }
            DecoderMode::JsonArray(scanner) => scanner.finish(),
        }
    }
}

fn sse_data(events: Vec<SseEvent>) -> Vec<String> {
    events
        .into_iter()
        .filter(|event| !event.data.is_empty())
        .map(|event| event.data)
        .collect()
}

fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let mut line = buffer[..pos].to_string();
        buffer.drain(..=pos);
        if line.ends_with('\r') {
            line.pop();
        }
        let line = line.trim();
        if !line.is_empty() {
            out.push(line.to_string());
        }
    }
    out
}

/// Pulls complete top-level objects out of a streamed `[{...},{...}]` body.
#[derive(Debug)]
struct ArrayScanner {
    current: String,
    depth: usize,
    in_string: bool,
    escaped: bool,
    opened: bool,
}

impl ArrayScanner {
    fn new() -> Self {
        Self {
            current: String::new(),
            depth: 0,
            in_string: false,
            escaped: false,
            opened: false,
        }
    }

    fn push(&mut self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        for ch in text.chars() {
            if !self.opened {
                if ch == '[' {
                    self.opened = true;
                }
                continue;
            }
            if self.depth == 0 {
                if ch == '{' {
                    self.depth = 1;
                    self.current.push(ch);
                }
                continue;
            }

            self.current.push(ch);
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if ch == '\\' {
                    self.escaped = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }
            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        out.push(std::mem::take(&mut self.current));
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<String> {
        if self.depth == 0 && !self.current.trim().is_empty() {
            vec![std::mem::take(&mut self.current)]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_events_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: message_start\nda").is_empty());
        let events = parser.push_str("ta: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn sse_comment_lines_are_skipped() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keep-alive\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn sse_multi_data_lines_join() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn decoder_detects_ndjson() {
        let mut decoder = WireDecoder::new();
        let out = decoder.push(&Bytes::from_static(b"{\"x\":1}\n{\"x\":2}\n"));
        assert_eq!(out, vec!["{\"x\":1}", "{\"x\":2}"]);
    }

    #[test]
    fn decoder_detects_json_array() {
        let mut decoder = WireDecoder::new();
        let mut out = decoder.push(&Bytes::from_static(b"[{\"x\":1},"));
        out.extend(decoder.push(&Bytes::from_static(b"{\"y\":\"}\"}]")));
        assert_eq!(out, vec!["{\"x\":1}", "{\"y\":\"}\"}"]);
    }

    #[test]
    fn decoder_detects_sse() {
        let mut decoder = WireDecoder::new();
        let out = decoder.push(&Bytes::from_static(b"data: {\"x\":1}\n\n"));
        assert_eq!(out, vec!["{\"x\":1}"]);
    }
}
