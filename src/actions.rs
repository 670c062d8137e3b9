use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::agent::AgentError;

/// Sleep applied by `wait` when the model does not say how long.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

// Logical key names emitted by the model, keyed by their lower-cased form.
const KEY_SYNONYMS: &[(&str, &str)] = &[
    ("/", "slash"),
    ("\\", "backslash"),
    ("arrowdown", "Down"),
    ("arrowleft", "Left"),
    ("arrowright", "Right"),
    ("arrowup", "Up"),
    ("backspace", "BackSpace"),
    ("capslock", "Caps_Lock"),
    ("cmd", "Meta_L"),
    ("delete", "Delete"),
    ("end", "End"),
    ("enter", "Return"),
    ("esc", "Escape"),
    ("home", "Home"),
    ("insert", "Insert"),
    ("option", "Alt_L"),
    ("pagedown", "Page_Down"),
    ("pageup", "Page_Up"),
    ("tab", "Tab"),
    ("win", "Meta_L"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// One call against the instance's `computer` endpoint. Serializes to the
/// request body the endpoint expects, e.g. `{"action":"click_mouse",...}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemoteCommand {
    ClickMouse {
        button: MouseButton,
        coordinates: [i64; 2],
        #[serde(skip_serializing_if = "Option::is_none")]
        num_clicks: Option<u32>,
    },
    DragMouse {
        path: Vec<[i64; 2]>,
    },
    PressKey {
        keys: Vec<String>,
    },
    MoveMouse {
        coordinates: [i64; 2],
    },
    TakeScreenshot,
    Scroll {
        delta_x: i64,
        delta_y: i64,
        coordinates: [i64; 2],
    },
    TypeText {
        text: String,
    },
}

impl RemoteCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCommand::ClickMouse { .. } => "click_mouse",
            RemoteCommand::DragMouse { .. } => "drag_mouse",
            RemoteCommand::PressKey { .. } => "press_key",
            RemoteCommand::MoveMouse { .. } => "move_mouse",
            RemoteCommand::TakeScreenshot => "take_screenshot",
            RemoteCommand::Scroll { .. } => "scroll",
            RemoteCommand::TypeText { .. } => "type_text",
        }
    }
}

/// What the executor has to do for one abstract action: optionally sleep,
/// then issue `command`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub delay: Option<Duration>,
    pub command: RemoteCommand,
}

impl Dispatch {
    fn now(command: RemoteCommand) -> Self {
        Self { delay: None, command }
    }
}

/// Case-folds `key` and resolves it through the synonym table. Names the
/// table does not know are passed through lower-cased.
pub fn map_key(key: &str) -> String {
    let lowered = key.to_lowercase();
    KEY_SYNONYMS
        .iter()
        .find(|(from, _)| *from == lowered)
        .map(|(_, to)| (*to).to_string())
        .unwrap_or(lowered)
}

/// Maps a single key or a `+` separated chord such as `ctrl+shift+t`.
/// Empty parts stand for the `+` key itself, so `ctrl++` is ctrl and plus.
pub fn map_chord(raw: &str) -> Vec<String> {
    if raw.len() <= 1 || !raw.contains('+') {
        return vec![map_key(raw)];
    }
    let mut keys = Vec::new();
    let mut in_plus = false;
    for part in raw.split('+').map(str::trim) {
        if part.is_empty() {
            // a run of empty parts is one literal `+`
            if !in_plus {
                keys.push("+".to_string());
                in_plus = true;
            }
        } else {
            keys.push(map_key(part));
            in_plus = false;
        }
    }
    keys
}

/// Translates the input of a `computer` tool call into the remote command
/// that carries it out. Performs no I/O.
pub fn translate(args: &Value) -> Result<Dispatch, AgentError> {
    let kind = args
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::MissingArgument {
            action: "computer".into(),
            field: "action".into(),
        })?;

    let command = match kind {
        "left_click" => click(kind, args, MouseButton::Left, None)?,
        "right_click" => click(kind, args, MouseButton::Right, None)?,
        "middle_click" => click(kind, args, MouseButton::Middle, None)?,
        "double_click" => click(kind, args, MouseButton::Left, Some(2))?,
        "triple_click" => click(kind, args, MouseButton::Left, Some(3))?,
        "left_click_drag" => {
            let start = coordinate(kind, args, &["startCoordinate", "start_coordinate"])?;
            let end = coordinate(kind, args, &["endCoordinate", "end_coordinate", "coordinate"])?;
            RemoteCommand::DragMouse { path: vec![start, end] }
        }
        "key" => {
            let raw = args
                .get("key")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .or_else(|| args.get("text").and_then(Value::as_str).filter(|s| !s.is_empty()))
                .ok_or_else(|| AgentError::MissingArgument {
                    action: kind.into(),
                    field: "key".into(),
                })?;
            RemoteCommand::PressKey { keys: map_chord(raw) }
        }
        "mouse_move" => RemoteCommand::MoveMouse {
            coordinates: coordinate(kind, args, &["coordinate"])?,
        },
        "screenshot" => RemoteCommand::TakeScreenshot,
        "wait" => {
            // A wait still ends in a capture so the model sees fresh state.
            return Ok(Dispatch {
                delay: Some(wait_duration(args)?),
                command: RemoteCommand::TakeScreenshot,
            });
        }
        "scroll" => scroll(kind, args)?,
        "type" => {
            let text = args
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| AgentError::MissingArgument {
                    action: kind.into(),
                    field: "text".into(),
                })?;
            RemoteCommand::TypeText { text: text.to_string() }
        }
        other => return Err(AgentError::UnknownAction(other.to_string())),
    };
    Ok(Dispatch::now(command))
}

fn click(
    kind: &str,
    args: &Value,
    button: MouseButton,
    num_clicks: Option<u32>,
) -> Result<RemoteCommand, AgentError> {
    Ok(RemoteCommand::ClickMouse {
        button,
        coordinates: coordinate(kind, args, &["coordinate"])?,
        num_clicks,
    })
}

fn scroll(kind: &str, args: &Value) -> Result<RemoteCommand, AgentError> {
    let coordinates = coordinate(kind, args, &["coordinate"])?;
    let direction = args
        .get("direction")
        .or_else(|| args.get("scroll_direction"))
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::MissingArgument {
            action: kind.into(),
            field: "direction".into(),
        })?;
    let [x, y] = coordinates;
    // left/up scroll towards the origin
    let (delta_x, delta_y) = match direction.to_ascii_lowercase().as_str() {
        "left" => (-x.abs(), 0),
        "right" => (x.abs(), 0),
        "up" => (0, -y.abs()),
        "down" => (0, y.abs()),
        other => {
            return Err(AgentError::InvalidArgument {
                action: kind.into(),
                detail: format!("unknown scroll direction `{other}`"),
            })
        }
    };
    Ok(RemoteCommand::Scroll { delta_x, delta_y, coordinates })
}

fn wait_duration(args: &Value) -> Result<Duration, AgentError> {
    let Some(raw) = args.get("duration") else {
        return Ok(DEFAULT_WAIT);
    };
    raw.as_f64()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| AgentError::InvalidArgument {
            action: "wait".into(),
            detail: format!("`duration` must be a non-negative number of seconds, got {raw}"),
        })
}

fn coordinate(kind: &str, args: &Value, keys: &[&str]) -> Result<[i64; 2], AgentError> {
    for key in keys {
        if let Some(v) = args.get(*key) {
            return point(v).ok_or_else(|| AgentError::InvalidArgument {
                action: kind.into(),
                detail: format!("`{key}` must be an [x, y] pair"),
            });
        }
    }
    Err(AgentError::MissingArgument {
        action: kind.into(),
        field: keys[0].into(),
    })
}

fn point(v: &Value) -> Option<[i64; 2]> {
    let arr = v.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let n = |v: &Value| v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64));
    Some([n(&arr[0])?, n(&arr[1])?])
}
