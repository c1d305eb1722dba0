//! Raw input dispatch: pointer paths, mouse buttons and keys

use bezier_rs::Bezier;
use phf::phf_map;
use rand::Rng;
use serde_json::json;
use std::time::Duration;

use crate::session::SessionManager;
use crate::Result;

/// Named keys: key name -> (code, windowsVirtualKeyCode, text)
static SPECIAL_KEYS: phf::Map<&'static str, (&'static str, i64, &'static str)> = phf_map! {
    "Enter" => ("Enter", 13, "\r"),
    "Tab" => ("Tab", 9, "\t"),
    "Escape" => ("Escape", 27, ""),
    "Backspace" => ("Backspace", 8, ""),
    "Delete" => ("Delete", 46, ""),
    "Space" => ("Space", 32, " "),
    "ArrowUp" => ("ArrowUp", 38, ""),
    "ArrowDown" => ("ArrowDown", 40, ""),
    "ArrowLeft" => ("ArrowLeft", 37, ""),
    "ArrowRight" => ("ArrowRight", 39, ""),
    "Home" => ("Home", 36, ""),
    "End" => ("End", 35, ""),
    "PageUp" => ("PageUp", 33, ""),
    "PageDown" => ("PageDown", 34, ""),
};

/// Key description passed to `Input.dispatchKeyEvent`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub key: String,
    pub code: String,
    pub key_code: i64,
    pub text: String,
}

impl KeySpec {
    /// Named key (`Enter`, `ArrowDown`, …) or a single character
    pub fn parse(name: &str) -> Option<Self> {
        if let Some((code, key_code, text)) = SPECIAL_KEYS.get(name) {
            let key = if name == "Space" { " " } else { name };
            return Some(Self {
                key: key.to_string(),
                code: code.to_string(),
                key_code: *key_code,
                text: text.to_string(),
            });
        }
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(ch), None) => Some(Self::for_char(ch)),
            _ => None,
        }
    }

    pub fn for_char(ch: char) -> Self {
        let (code, key_code) = if ch.is_ascii_alphabetic() {
            (format!("Key{}", ch.to_ascii_uppercase()), ch.to_ascii_uppercase() as i64)
        } else if ch.is_ascii_digit() {
            (format!("Digit{}", ch), ch as i64)
        } else {
            (String::new(), 0)
        };
        Self {
            key: ch.to_string(),
            code,
            key_code,
            text: ch.to_string(),
        }
    }
}

/// Pointer path from `start` to `end`; just the end point when not humanized
pub fn pointer_path(start: (f64, f64), end: (f64, f64), humanize: bool) -> Vec<(f64, f64)> {
    if !humanize {
        return vec![end];
    }

    let (dx, dy) = (end.0 - start.0, end.1 - start.1);
    let distance = (dx * dx + dy * dy).sqrt();
    let deviation = (distance * 0.2).clamp(5.0, 60.0);
    let mut rng = rand::thread_rng();
    let mut jitter = || (rng.gen::<f64>() - 0.5) * deviation;

    let cp1 = (start.0 + dx * 0.25 + jitter(), start.1 + dy * 0.25 + jitter());
    let cp2 = (end.0 - dx * 0.25 + jitter(), end.1 - dy * 0.25 + jitter());

    let bezier = Bezier::from_cubic_coordinates(start.0, start.1, cp1.0, cp1.1, cp2.0, cp2.1, end.0, end.1);
    let points = ((distance / 25.0) as usize).clamp(8, 30);

    let mut path: Vec<(f64, f64)> = (1..=points)
        .map(|i| {
            let t = i as f64 / points as f64;
            let point = bezier.evaluate(bezier_rs::TValue::Euclidean(t));
            (point[0], point[1])
        })
        .collect();
    // land exactly on the target
    if let Some(last) = path.last_mut() {
        *last = end;
    }
    path
}

/// Delay between keystrokes
pub fn keystroke_delay(fixed_ms: Option<u64>, humanize: bool) -> Duration {
    match (fixed_ms, humanize) {
        (Some(ms), _) => Duration::from_millis(ms),
        (None, true) => random_millis(50, 150),
        (None, false) => Duration::ZERO,
    }
}

fn random_millis(low: u64, high: u64) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

/// Move the pointer along `path`
pub async fn move_pointer(manager: &SessionManager, target_id: &str, path: &[(f64, f64)], humanize: bool) -> Result<()> {
    for &(x, y) in path {
        manager
            .send_to_target(
                target_id,
                "Input.dispatchMouseEvent",
                json!({ "type": "mouseMoved", "x": x, "y": y }),
            )
            .await?;
        if humanize {
            let pause = random_millis(4, 12);
            tokio::time::sleep(pause).await;
        }
    }
    Ok(())
}

/// Left button press and release at `(x, y)`
pub async fn mouse_click(manager: &SessionManager, target_id: &str, x: f64, y: f64, humanize: bool) -> Result<()> {
    for event_type in ["mousePressed", "mouseReleased"] {
        manager
            .send_to_target(
                target_id,
                "Input.dispatchMouseEvent",
                json!({
                    "type": event_type,
                    "x": x,
                    "y": y,
                    "button": "left",
                    "buttons": if event_type == "mousePressed" { 1 } else { 0 },
                    "clickCount": 1,
                }),
            )
            .await?;
        if humanize && event_type == "mousePressed" {
            let hold = random_millis(40, 110);
            tokio::time::sleep(hold).await;
        }
    }
    Ok(())
}

/// Wheel scroll at `(x, y)`
pub async fn mouse_wheel(manager: &SessionManager, target_id: &str, x: f64, y: f64, delta_x: f64, delta_y: f64) -> Result<()> {
    manager
        .send_to_target(
            target_id,
            "Input.dispatchMouseEvent",
            json!({
                "type": "mouseWheel",
                "x": x,
                "y": y,
                "deltaX": delta_x,
                "deltaY": delta_y,
            }),
        )
        .await?;
    Ok(())
}

/// keyDown + keyUp for one key
pub async fn press(manager: &SessionManager, target_id: &str, key: &KeySpec) -> Result<()> {
    let mut down = json!({
        "type": "keyDown",
        "key": key.key,
        "code": key.code,
        "windowsVirtualKeyCode": key.key_code,
    });
    if !key.text.is_empty() {
        down["text"] = json!(key.text);
        down["unmodifiedText"] = json!(key.text);
    }
    manager.send_to_target(target_id, "Input.dispatchKeyEvent", down).await?;
    manager
        .send_to_target(
            target_id,
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "key": key.key,
                "code": key.code,
                "windowsVirtualKeyCode": key.key_code,
            }),
        )
        .await?;
    Ok(())
}
