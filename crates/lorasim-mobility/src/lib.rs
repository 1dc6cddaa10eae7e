//! # lorasim-mobility
//!
//! Parsing of NS-2 movement scripts into typed commands.
//!
//! Two line shapes are recognized:
//!
//! ```text
//! $node_(0) set X_ 150.0
//! $ns_ at 0.31 "$node_(1) setdest 159.68 110.0 50.40"
//! ```
//!
//! The first sets a single axis of a node, the second schedules a movement
//! towards a destination at a given speed. Every other line is skipped.
//! Values carry the units of the script: meters, seconds and meters per
//! second. Unit conversion is left to whoever executes the commands.

use serde::Serialize;
use std::fmt;
use std::io::BufRead;

use thiserror::Error;

// ============================================================================
// Command Types
// ============================================================================

/// A target axis of a `set` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
            Axis::Z => write!(f, "Z"),
        }
    }
}

/// The NS-2 `set` command: place one axis of a node at a value (meters).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetCommand {
    /// Target node id.
    pub node: String,
    /// Axis to set.
    pub axis: Axis,
    /// New axis value in meters.
    pub val: f64,
}

/// The NS-2 `setdest` command: start moving a node towards a destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetDestCommand {
    /// Target node id.
    pub node: String,
    /// Start time in seconds from the beginning of the mobility run.
    pub time: f64,
    /// Destination x in meters.
    pub x: f64,
    /// Destination y in meters.
    pub y: f64,
    /// Movement speed in meters per second.
    pub speed: f64,
}

/// A single parsed movement command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Command {
    /// Immediate axis placement.
    Set(SetCommand),
    /// Timed movement towards a destination.
    SetDest(SetDestCommand),
}

impl Command {
    /// Render the command back into its NS-2 source form.
    ///
    /// Parsing the returned line yields a command equal to `self`.
    pub fn to_line(&self) -> String {
        match self {
            Command::Set(set) => format!("${} set {}_ {}", set.node, set.axis, set.val),
            Command::SetDest(dest) => format!(
                "$ns_ at {} \"${} setdest {} {} {}\"",
                dest.time, dest.node, dest.x, dest.y, dest.speed
            ),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors produced while parsing a movement script.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A field that should hold a float did not parse.
    #[error("can't parse float {value:?} on line {line}")]
    MalformedNumber {
        /// The offending token.
        value: String,
        /// 1-based source line.
        line: usize,
    },

    /// A `set` line named an axis other than X, Y or Z.
    #[error("unknown axis {axis:?} on line {line}")]
    UnknownAxis {
        /// The offending axis letter.
        axis: String,
        /// 1-based source line.
        line: usize,
    },

    /// Reading from the underlying source failed.
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Parser
// ============================================================================

/// Parse an NS-2 movement script from a reader.
///
/// Returns the commands in source order. Lines matching neither recognized
/// shape are skipped; a matching line with a bad number or axis aborts the
/// parse with the first error.
pub fn parse<R: BufRead>(reader: R) -> Result<Vec<Command>, ParseError> {
    let mut commands = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(command) = parse_line(&line, idx + 1)? {
            commands.push(command);
        }
    }

    Ok(commands)
}

/// Parse a movement script held in a string.
pub fn parse_str(input: &str) -> Result<Vec<Command>, ParseError> {
    parse(input.as_bytes())
}

fn parse_line(line: &str, lineno: usize) -> Result<Option<Command>, ParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();

    // $<node> set <axis>_ <float>
    if tokens.len() == 4 && tokens[0].starts_with('$') && tokens[1] == "set" {
        if let Some(axis_name) = tokens[2].strip_suffix('_') {
            let axis = match axis_name {
                "X" => Axis::X,
                "Y" => Axis::Y,
                "Z" => Axis::Z,
                other => {
                    return Err(ParseError::UnknownAxis {
                        axis: other.to_string(),
                        line: lineno,
                    })
                }
            };

            return Ok(Some(Command::Set(SetCommand {
                node: tokens[0][1..].to_string(),
                axis,
                val: parse_float(tokens[3], lineno)?,
            })));
        }
    }

    // $<any> at <float> "?$<node> setdest <float> <float> <float>"?
    if tokens.len() == 8
        && tokens[0].starts_with('$')
        && tokens[1] == "at"
        && tokens[4] == "setdest"
    {
        let node_token = tokens[3].trim_matches('"');
        if let Some(node) = node_token.strip_prefix('$') {
            return Ok(Some(Command::SetDest(SetDestCommand {
                node: node.to_string(),
                time: parse_float(tokens[2], lineno)?,
                x: parse_float(tokens[5], lineno)?,
                y: parse_float(tokens[6], lineno)?,
                speed: parse_float(tokens[7].trim_matches('"'), lineno)?,
            })));
        }
    }

    Ok(None)
}

fn parse_float(token: &str, lineno: usize) -> Result<f64, ParseError> {
    token.parse().map_err(|_| ParseError::MalformedNumber {
        value: token.to_string(),
        line: lineno,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"$node_(0) set X_ 150.0
$node_(0) set Y_ 93.98597018956875
$ns_ at 0.0 $node_(0) setdest 150.0 110.0 50.40378694202284
$ns_ at 0.3177148143422528 $node_(1) setdest 159.68580405978113 110.0 50.40378694196106
$ns_ at 0.5098790275378633 "$node_(1) setdest 164.68580405978113 110.0 50.129146111974336""#;

    #[test]
    fn test_parse() {
        let commands = parse_str(SCRIPT).unwrap();

        let expected = vec![
            Command::Set(SetCommand {
                node: "node_(0)".to_string(),
                axis: Axis::X,
                val: 150.0,
            }),
            Command::Set(SetCommand {
                node: "node_(0)".to_string(),
                axis: Axis::Y,
                val: 93.98597018956875,
            }),
            Command::SetDest(SetDestCommand {
                node: "node_(0)".to_string(),
                time: 0.0,
                x: 150.0,
                y: 110.0,
                speed: 50.40378694202284,
            }),
            Command::SetDest(SetDestCommand {
                node: "node_(1)".to_string(),
                time: 0.3177148143422528,
                x: 159.68580405978113,
                y: 110.0,
                speed: 50.40378694196106,
            }),
            Command::SetDest(SetDestCommand {
                node: "node_(1)".to_string(),
                time: 0.5098790275378633,
                x: 164.68580405978113,
                y: 110.0,
                speed: 50.129146111974336,
            }),
        ];

        assert_eq!(commands, expected);
    }

    #[test]
    fn test_unrecognized_lines_are_skipped() {
        let script = "# a comment\n\nset opt(x) 500\n$node_(0) set X_ 1.5\n";
        let commands = parse_str(script).unwrap();
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn test_unknown_axis() {
        let err = parse_str("$node_(0) set W_ 1.0").unwrap_err();
        match err {
            ParseError::UnknownAxis { axis, line } => {
                assert_eq!(axis, "W");
                assert_eq!(line, 1);
            }
            other => panic!("expected UnknownAxis, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_number() {
        let err = parse_str("$node_(0) set X_ 1.2.3").unwrap_err();
        assert!(matches!(err, ParseError::MalformedNumber { .. }));

        let err = parse_str("$ns_ at abc $node_(0) setdest 1 2 3").unwrap_err();
        match err {
            ParseError::MalformedNumber { value, line } => {
                assert_eq!(value, "abc");
                assert_eq!(line, 1);
            }
            other => panic!("expected MalformedNumber, got {other:?}"),
        }
    }

    #[test]
    fn test_round_trip() {
        let commands = parse_str(SCRIPT).unwrap();

        let emitted: String = commands
            .iter()
            .map(|c| c.to_line())
            .collect::<Vec<_>>()
            .join("\n");

        let reparsed = parse_str(&emitted).unwrap();
        assert_eq!(commands, reparsed);
    }
}
