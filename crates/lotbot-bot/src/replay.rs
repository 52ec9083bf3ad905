//! Line-oriented event script for offline runs.
//!
//! ```text
//! # comment
//! R,<raw broker reply record>
//! T,<product>,<price>
//! O,<direction>,<product>,<target price>,<lots>
//! M,<virtual|real>
//! ```
//!
//! `O` opens a group of `lots` lots and submits all of them.

use std::path::Path;

use lotbot_core::{Direction, NewGroup, Price, ProductCode};
use lotbot_executor::OrderMode;

use crate::app::BotEvent;
use crate::error::{AppError, AppResult};

/// Parse one script line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str, line_no: usize) -> AppResult<Option<BotEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let err = |message: String| AppError::Replay {
        line: line_no,
        message,
    };
    let (tag, rest) = line
        .split_once(',')
        .ok_or_else(|| err(format!("missing payload: {line}")))?;

    let event = match tag.trim() {
        "R" => BotEvent::Report(rest.to_string()),
        "T" => {
            let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
            let [product, price] = fields[..] else {
                return Err(err(format!("tick needs product,price: {rest}")));
            };
            BotEvent::Tick {
                product: ProductCode::new(product),
                price: parse_price(price).map_err(err)?,
            }
        }
        "O" => {
            let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
            let [direction, product, target, lots] = fields[..] else {
                return Err(err(format!(
                    "entry needs direction,product,target,lots: {rest}"
                )));
            };
            let direction: Direction = direction.parse().map_err(|e| err(format!("{e}")))?;
            let lots: u8 = lots
                .parse()
                .map_err(|_| err(format!("lots not an integer: {lots}")))?;
            BotEvent::Entry {
                params: NewGroup {
                    direction,
                    product: ProductCode::new(product),
                    target_price: parse_price(target).map_err(err)?,
                    total_lots: lots,
                },
                lots,
            }
        }
        "M" => {
            let mode: OrderMode = rest.parse().map_err(|e| err(format!("{e}")))?;
            BotEvent::SetMode(mode)
        }
        other => return Err(err(format!("unknown tag {other}"))),
    };
    Ok(Some(event))
}

fn parse_price(raw: &str) -> Result<Price, String> {
    raw.parse::<Price>()
        .map_err(|e| format!("bad price {raw}: {e}"))
}

/// Read a whole script. Stops at the first bad line.
pub fn read_script(path: impl AsRef<Path>) -> AppResult<Vec<BotEvent>> {
    let content = std::fs::read_to_string(path)?;
    let mut events = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if let Some(event) = parse_line(line, idx + 1)? {
            events.push(event);
        }
    }
    Ok(events)
}
