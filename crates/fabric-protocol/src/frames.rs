//! Topic-socket message frames.
//!
//! A topic message is an ordered list of string frames. Inside plugin chains
//! messages travel as `serde_json::Value`; raw frames enter a receive chain as
//! a JSON array of strings and whatever a send chain produces is flattened
//! back into frames before it reaches the socket.

use serde_json::Value;

/// One topic-socket message.
pub type Frames = Vec<String>;

/// Decode raw socket frames into strings. Invalid UTF-8 is replaced, not rejected.
pub fn decode_frames<I, B>(raw: I) -> Frames
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    raw.into_iter()
        .map(|frame| String::from_utf8_lossy(frame.as_ref()).into_owned())
        .collect()
}

/// Wrap frames as the value fed to a receive chain.
pub fn frames_to_value(frames: &[String]) -> Value {
    Value::Array(frames.iter().cloned().map(Value::String).collect())
}

/// Flatten the output of a send chain into frames.
///
/// Arrays become one frame per element, strings a single frame, `null` no
/// frames at all, and anything else a single frame holding its JSON text.
pub fn value_to_frames(value: Value) -> Frames {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => vec![s],
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        other => vec![other.to_string()],
    }
}
