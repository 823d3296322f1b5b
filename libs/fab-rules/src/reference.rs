//! Reference resolver
//!
//! Resolves `@`-prefixed expressions against the runtime state:
//! - `@queue[index]` with an optional `+N` / `-N` suffix
//! - `@station.waferId`
//!
//! Anything unparsable or missing resolves to 0. Parsing happens once when the
//! catalog is loaded; resolution is read-only against `RuntimeState`.

use crate::state::RuntimeState;
use crate::types::{Operand, Reference, WaferId};

const REFERENCE_PREFIX: char = '@';
const WAFER_PROPERTY: &str = "waferId";

impl Reference {
    /// Parse a reference body (without the leading `@`)
    pub fn parse(expr: &str) -> Self {
        let expr = expr.trim();
        if let Some(open) = expr.find('[') {
            return parse_queue_index(expr, open)
                .unwrap_or_else(|| Reference::Unresolvable { raw: expr.to_string() });
        }

        match expr.rsplit_once('.') {
            Some((station, WAFER_PROPERTY)) if !station.is_empty() => Reference::StationWafer {
                station: station.to_string(),
            },
            _ => Reference::Unresolvable {
                raw: expr.to_string(),
            },
        }
    }

    /// Resolve to a concrete integer, 0 when out of range or missing
    pub fn resolve(&self, state: &RuntimeState) -> WaferId {
        match self {
            Reference::QueueIndex {
                queue,
                index,
                offset,
            } => state
                .queue(queue)
                .and_then(|q| q.get(*index))
                .and_then(|wafer| wafer.checked_add(*offset))
                .unwrap_or(0),
            Reference::StationWafer { station } => state
                .station_wafer(station)
                .or_else(|| state.robot_wafer(station))
                .unwrap_or(0),
            Reference::Unresolvable { raw } => {
                tracing::debug!("Unresolvable ref @{}", raw);
                0
            },
        }
    }
}

/// `queue[index]` followed by nothing, `+N` or `-N`
fn parse_queue_index(expr: &str, open: usize) -> Option<Reference> {
    let close = expr[open..].find(']')? + open;
    let queue = expr[..open].trim();
    if queue.is_empty() {
        return None;
    }

    let index = expr[open + 1..close].trim().parse::<usize>().ok()?;

    let suffix = expr[close + 1..].trim();
    let offset = if suffix.is_empty() {
        0
    } else if let Some(n) = suffix.strip_prefix('-') {
        -n.trim().parse::<i64>().ok()?
    } else if let Some(n) = suffix.strip_prefix('+') {
        n.trim().parse::<i64>().ok()?
    } else {
        return None;
    };

    Some(Reference::QueueIndex {
        queue: queue.to_string(),
        index,
        offset,
    })
}

impl Operand {
    /// Classify a raw string: `@...` is a reference, anything else a literal
    pub fn from_text(raw: &str) -> Self {
        match raw.strip_prefix(REFERENCE_PREFIX) {
            Some(body) => Operand::Reference(Reference::parse(body)),
            None => Operand::Text(raw.to_string()),
        }
    }

    /// Resolve to an integer; non-numeric text is 0
    pub fn resolve_int(&self, state: &RuntimeState) -> i64 {
        match self {
            Operand::Int(n) => *n,
            Operand::Text(s) => s.trim().parse().unwrap_or(0),
            Operand::Reference(r) => r.resolve(state),
        }
    }

    /// Resolve to text, references become their integer value
    pub fn resolve_text(&self, state: &RuntimeState) -> String {
        match self {
            Operand::Int(n) => n.to_string(),
            Operand::Text(s) => s.clone(),
            Operand::Reference(r) => r.resolve(state).to_string(),
        }
    }

    /// Literal integer value, references are not resolved
    pub fn literal_int(&self) -> Option<i64> {
        match self {
            Operand::Int(n) => Some(*n),
            Operand::Text(s) => s.trim().parse().ok(),
            Operand::Reference(_) => None,
        }
    }
}

/// Resolve a raw string: literals come back unchanged, references as their value
pub fn resolve_str(input: &str, state: &RuntimeState) -> String {
    Operand::from_text(input).resolve_text(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_pending(total: usize) -> RuntimeState {
        RuntimeState::new(total)
    }

    #[test]
    fn test_parse_queue_index_forms() {
        assert_eq!(
            Reference::parse("LoadPort.Pending[0]"),
            Reference::QueueIndex {
                queue: "LoadPort.Pending".to_string(),
                index: 0,
                offset: 0
            }
        );
        assert_eq!(
            Reference::parse("LoadPort.Pending[2]-3"),
            Reference::QueueIndex {
                queue: "LoadPort.Pending".to_string(),
                index: 2,
                offset: -3
            }
        );
        assert_eq!(
            Reference::parse("LoadPort.Completed[0]+1"),
            Reference::QueueIndex {
                queue: "LoadPort.Completed".to_string(),
                index: 0,
                offset: 1
            }
        );
    }

    #[test]
    fn test_parse_malformed() {
        for raw in ["LoadPort.Pending[x]", "[0]", "Q[0]*2", "Q[0", "polisher.state", "foo"] {
            assert!(
                matches!(Reference::parse(raw), Reference::Unresolvable { .. }),
                "{} should be unresolvable",
                raw
            );
        }
    }

    #[test]
    fn test_resolve_arithmetic_offset() {
        let mut state = state_with_pending(12);
        // Head becomes 10
        for _ in 0..9 {
            state.queue_mut("LoadPort.Pending").pop_front();
        }
        assert_eq!(resolve_str("@LoadPort.Pending[0]-3", &state), "7");
        assert_eq!(resolve_str("@LoadPort.Pending[1]+2", &state), "13");
    }

    #[test]
    fn test_resolve_overflowing_offset_is_zero() {
        let state = state_with_pending(3);
        let reference = Reference::parse("LoadPort.Pending[0]+9223372036854775807");
        assert!(matches!(reference, Reference::QueueIndex { .. }));
        assert_eq!(reference.resolve(&state), 0);
        assert_eq!(
            resolve_str("@LoadPort.Pending[0]-9223372036854775807", &state),
            "-9223372036854775806"
        );
    }

    #[test]
    fn test_resolve_out_of_range_and_missing() {
        let state = state_with_pending(2);
        assert_eq!(resolve_str("@LoadPort.Pending[5]", &state), "0");
        assert_eq!(resolve_str("@Nowhere[0]", &state), "0");
        assert_eq!(resolve_str("@polisher.waferId", &state), "0");
        assert_eq!(resolve_str("@garbage", &state), "0");
    }

    #[test]
    fn test_resolve_station_wafer() {
        let mut state = state_with_pending(3);
        state.set_station_status("polisher", "processing", Some(2));
        state.set_robot_status("R1", "holding", Some(3), None);
        assert_eq!(resolve_str("@polisher.waferId", &state), "2");
        assert_eq!(resolve_str("@R1.waferId", &state), "3");
    }

    #[test]
    fn test_literal_passthrough() {
        let state = state_with_pending(1);
        assert_eq!(resolve_str("cleaner", &state), "cleaner");
        assert_eq!(Operand::from_text("@Q[0]").literal_int(), None);
        assert_eq!(Operand::from_text("42").literal_int(), Some(42));
    }
}
