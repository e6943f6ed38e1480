use hyper::body::{Bytes, Frame};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tracing::debug;

use crate::tokens::estimate;
use crate::translate::claude::{
    ContentBlock, ContentDelta, MessageDeltaData, MessageStart, Role, StopReason, StreamEvent,
    Usage,
};

/// A complete tool invocation ready to be emitted as one block.
#[derive(Debug, Clone)]
pub struct ToolCallEmit {
    pub id: String,
    pub name: String,
    /// Arguments, already serialized to a JSON string.
    pub arguments: String,
}

pub type FrameSender = mpsc::Sender<Result<Frame<Bytes>, Infallible>>;

/// State machine multiplexing upstream deltas into the client's
/// content-block SSE protocol.
///
/// At most one text and one thinking block are open at a time, and never
/// both; tool-use blocks open and close atomically. Every opened block gets
/// exactly one stop. Once a write fails (client gone) nothing further is
/// emitted.
pub struct StreamEmitter {
    tx: FrameSender,
    message_id: String,
    model: String,
    next_index: u32,
    text_block: Option<u32>,
    thinking_block: Option<u32>,
    input_tokens: u32,
    total_output_tokens: u32,
    finished: bool,
    closed: bool,
}

impl StreamEmitter {
    pub fn new(tx: FrameSender, request_id: &str, model: &str, input_tokens: u32) -> Self {
        Self {
            tx,
            message_id: format!("msg_{request_id}"),
            model: model.to_string(),
            next_index: 0,
            text_block: None,
            thinking_block: None,
            input_tokens,
            total_output_tokens: 0,
            finished: false,
            closed: false,
        }
    }

    /// Emit the message envelope. Must be called once, before any deltas.
    pub async fn start(&mut self) {
        let event = StreamEvent::MessageStart {
            message: Box::new(MessageStart {
                id: self.message_id.clone(),
                message_type: "message".to_string(),
                role: Role::Assistant,
                content: vec![],
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                },
            }),
        };
        self.emit(&event).await;
    }

    pub async fn send_text(&mut self, chunk: &str) {
        if chunk.is_empty() || self.finished {
            return;
        }
        self.close_thinking_block().await;

        if self.text_block.is_none() {
            let index = self.next_index;
            self.next_index += 1;
            self.text_block = Some(index);
            self.emit(&StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::Text {
                    text: String::new(),
                    cache_control: None,
                },
            })
            .await;
        }

        let index = self.text_block.unwrap();
        self.emit(&StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::Text {
                text: chunk.to_string(),
            },
        })
        .await;
        self.total_output_tokens += estimate(chunk);
    }

    pub async fn send_thinking(&mut self, chunk: &str) {
        if chunk.is_empty() || self.finished {
            return;
        }
        self.close_text_block().await;

        if self.thinking_block.is_none() {
            let index = self.next_index;
            self.next_index += 1;
            self.thinking_block = Some(index);
            self.emit(&StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
            })
            .await;
        }

        let index = self.thinking_block.unwrap();
        self.emit(&StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::Thinking {
                thinking: chunk.to_string(),
            },
        })
        .await;
        self.total_output_tokens += estimate(chunk);
    }

    /// Each call occupies its own block: start, one full input_json_delta,
    /// stop.
    pub async fn send_tool_calls(&mut self, calls: &[ToolCallEmit]) {
        if self.finished {
            return;
        }
        self.close_text_block().await;
        self.close_thinking_block().await;

        for call in calls {
            let index = self.next_index;
            self.next_index += 1;

            self.emit(&StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: serde_json::Value::Object(serde_json::Map::new()),
                },
            })
            .await;
            self.emit(&StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::InputJson {
                    partial_json: call.arguments.clone(),
                },
            })
            .await;
            self.emit(&StreamEvent::ContentBlockStop { index }).await;
            self.total_output_tokens += estimate(&call.arguments);
        }
    }

    /// Close open blocks and end the message. Idempotent.
    pub async fn finish(&mut self, usage: Option<(u32, u32)>) {
        if self.finished {
            return;
        }
        self.finished = true;

        self.close_text_block().await;
        self.close_thinking_block().await;

        let (input_tokens, output_tokens) =
            usage.unwrap_or((self.input_tokens, self.total_output_tokens));

        self.emit(&StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Usage {
                input_tokens,
                output_tokens,
            },
        })
        .await;
        self.emit(&StreamEvent::MessageStop).await;
    }

    /// Surface an upstream failure that happened mid-stream.
    pub async fn send_error(&mut self, error_type: &str, message: &str) {
        if self.finished {
            return;
        }
        self.close_text_block().await;
        self.close_thinking_block().await;
        self.emit(&StreamEvent::Error {
            error: crate::translate::claude::ErrorData {
                error_type: error_type.to_string(),
                message: message.to_string(),
            },
        })
        .await;
    }

    pub fn output_tokens(&self) -> u32 {
        self.total_output_tokens
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close_text_block(&mut self) {
        if let Some(index) = self.text_block.take() {
            self.emit(&StreamEvent::ContentBlockStop { index }).await;
        }
    }

    async fn close_thinking_block(&mut self) {
        if let Some(index) = self.thinking_block.take() {
            self.emit(&StreamEvent::ContentBlockStop { index }).await;
        }
    }

    async fn emit(&mut self, event: &StreamEvent) {
        if self.closed {
            return;
        }
        let frame = Frame::data(Bytes::from(format_sse_event(event)));
        if self.tx.send(Ok(frame)).await.is_err() {
            debug!("Client disconnected, stopping stream emission");
            self.closed = true;
        }
    }
}

pub fn format_sse_event(event: &StreamEvent) -> String {
    let event_type = match event {
        StreamEvent::MessageStart { .. } => "message_start",
        StreamEvent::ContentBlockStart { .. } => "content_block_start",
        StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
        StreamEvent::ContentBlockStop { .. } => "content_block_stop",
        StreamEvent::MessageDelta { .. } => "message_delta",
        StreamEvent::MessageStop => "message_stop",
        StreamEvent::Ping => "ping",
        StreamEvent::Error { .. } => "error",
    };

    let data = serde_json::to_string(event).unwrap_or_default();
    format!("event: {event_type}\ndata: {data}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        emitter: StreamEmitter,
        rx: mpsc::Receiver<Result<Frame<Bytes>, Infallible>>,
    }

    fn harness(input_tokens: u32) -> Harness {
        let (tx, rx) = mpsc::channel(256);
        Harness {
            emitter: StreamEmitter::new(tx, "req_1", "gemini-3-flash", input_tokens),
            rx,
        }
    }

    /// Drain the channel into (event_name, payload) pairs.
    fn drain(rx: &mut mpsc::Receiver<Result<Frame<Bytes>, Infallible>>) -> Vec<(String, serde_json::Value)> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let bytes = frame.unwrap().into_data().unwrap();
            let text = String::from_utf8(bytes.to_vec()).unwrap();
            for chunk in text.split("\n\n").filter(|c| !c.is_empty()) {
                let mut name = String::new();
                let mut data = serde_json::Value::Null;
                for line in chunk.lines() {
                    if let Some(n) = line.strip_prefix("event: ") {
                        name = n.to_string();
                    } else if let Some(d) = line.strip_prefix("data: ") {
                        data = serde_json::from_str(d).unwrap();
                    }
                }
                events.push((name, data));
            }
        }
        events
    }

    #[tokio::test]
    async fn full_sequence_thinking_text_tool_finish() {
        let mut h = harness(10);

        h.emitter.start().await;
        h.emitter.send_thinking("a").await;
        h.emitter.send_text("b").await;
        h.emitter
            .send_tool_calls(&[ToolCallEmit {
                id: "t1".into(),
                name: "f".into(),
                arguments: "{}".into(),
            }])
            .await;
        h.emitter.finish(Some((10, 3))).await;

        let events = drain(&mut h.rx);
        let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        // Envelope
        let start = &events[0].1["message"];
        assert_eq!(start["id"], "msg_req_1");
        assert_eq!(start["role"], "assistant");
        assert_eq!(start["usage"]["input_tokens"], 10);
        assert_eq!(start["usage"]["output_tokens"], 0);
        assert_eq!(start["stop_reason"], serde_json::Value::Null);

        // Thinking block at index 0
        assert_eq!(events[1].1["index"], 0);
        assert_eq!(events[1].1["content_block"]["type"], "thinking");
        assert_eq!(events[2].1["delta"]["type"], "thinking_delta");
        assert_eq!(events[2].1["delta"]["thinking"], "a");
        assert_eq!(events[3].1["index"], 0);

        // Text block at index 1
        assert_eq!(events[4].1["index"], 1);
        assert_eq!(events[4].1["content_block"]["type"], "text");
        assert_eq!(events[5].1["delta"]["type"], "text_delta");
        assert_eq!(events[5].1["delta"]["text"], "b");

        // Tool block at index 2, one full json delta
        assert_eq!(events[7].1["index"], 2);
        assert_eq!(events[7].1["content_block"]["type"], "tool_use");
        assert_eq!(events[7].1["content_block"]["id"], "t1");
        assert_eq!(events[8].1["delta"]["type"], "input_json_delta");
        assert_eq!(events[8].1["delta"]["partial_json"], "{}");

        // Final usage
        assert_eq!(events[10].1["delta"]["stop_reason"], "end_turn");
        assert_eq!(events[10].1["usage"]["input_tokens"], 10);
        assert_eq!(events[10].1["usage"]["output_tokens"], 3);
    }

    #[tokio::test]
    async fn block_discipline_every_start_has_one_stop() {
        let mut h = harness(1);

        h.emitter.start().await;
        h.emitter.send_text("one").await;
        h.emitter.send_thinking("two").await;
        h.emitter.send_text("three").await;
        h.emitter.send_thinking("four").await;
        h.emitter.finish(None).await;

        let events = drain(&mut h.rx);

        let mut open: std::collections::HashSet<u64> = std::collections::HashSet::new();
        let mut stopped: Vec<u64> = Vec::new();
        for (name, data) in &events {
            match name.as_str() {
                "content_block_start" => {
                    let index = data["index"].as_u64().unwrap();
                    assert!(open.insert(index), "index {index} opened twice");
                }
                "content_block_delta" => {
                    let index = data["index"].as_u64().unwrap();
                    assert!(open.contains(&index), "delta outside open block");
                }
                "content_block_stop" => {
                    let index = data["index"].as_u64().unwrap();
                    assert!(open.remove(&index), "stop without start");
                    stopped.push(index);
                }
                _ => {}
            }
            // Text and thinking blocks never open simultaneously
            assert!(open.len() <= 1, "two blocks open at once");
        }
        assert!(open.is_empty(), "unclosed blocks: {open:?}");
        assert_eq!(stopped, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn consecutive_same_type_chunks_share_a_block() {
        let mut h = harness(1);

        h.emitter.start().await;
        h.emitter.send_text("a").await;
        h.emitter.send_text("b").await;
        h.emitter.send_text("c").await;
        h.emitter.finish(None).await;

        let events = drain(&mut h.rx);
        let starts = events
            .iter()
            .filter(|(n, _)| n == "content_block_start")
            .count();
        let deltas = events
            .iter()
            .filter(|(n, _)| n == "content_block_delta")
            .count();
        assert_eq!(starts, 1);
        assert_eq!(deltas, 3);
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let mut h = harness(1);

        h.emitter.start().await;
        h.emitter.send_text("x").await;
        h.emitter.finish(None).await;
        h.emitter.finish(None).await;
        h.emitter.send_text("after finish").await;

        let events = drain(&mut h.rx);
        let stops = events.iter().filter(|(n, _)| n == "message_stop").count();
        assert_eq!(stops, 1);
        let deltas = events
            .iter()
            .filter(|(n, _)| n == "content_block_delta")
            .count();
        assert_eq!(deltas, 1);
    }

    #[tokio::test]
    async fn finish_without_usage_reports_estimates() {
        let mut h = harness(7);

        h.emitter.start().await;
        h.emitter.send_text("12345678").await; // 8 chars -> 2 tokens
        h.emitter.finish(None).await;

        let events = drain(&mut h.rx);
        let (_, delta) = events
            .iter()
            .find(|(n, _)| n == "message_delta")
            .unwrap();
        assert_eq!(delta["usage"]["input_tokens"], 7);
        assert_eq!(delta["usage"]["output_tokens"], 2);
    }

    #[tokio::test]
    async fn each_tool_call_gets_a_fresh_index() {
        let mut h = harness(1);

        h.emitter.start().await;
        h.emitter
            .send_tool_calls(&[
                ToolCallEmit {
                    id: "t1".into(),
                    name: "first".into(),
                    arguments: r#"{"a":1}"#.into(),
                },
                ToolCallEmit {
                    id: "t2".into(),
                    name: "second".into(),
                    arguments: r#"{"b":2}"#.into(),
                },
            ])
            .await;
        h.emitter.finish(None).await;

        let events = drain(&mut h.rx);
        let tool_starts: Vec<u64> = events
            .iter()
            .filter(|(n, d)| n == "content_block_start" && d["content_block"]["type"] == "tool_use")
            .map(|(_, d)| d["index"].as_u64().unwrap())
            .collect();
        assert_eq!(tool_starts, vec![0, 1]);
    }

    #[tokio::test]
    async fn dropped_receiver_stops_emission() {
        let mut h = harness(1);
        h.emitter.start().await;
        drop(h.rx);

        h.emitter.send_text("into the void").await;
        assert!(h.emitter.is_closed());

        // Further sends are silent no-ops rather than errors
        h.emitter.send_thinking("still nothing").await;
        h.emitter.finish(None).await;
    }
}
