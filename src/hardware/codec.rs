//! Register protocol codec for the controller and low-voltage crates.
//!
//! Protocol overview:
//! - Commands: one ASCII directive per reading kind with the board number
//!   embedded (`$T3`), followed by the link's command ending (`\n\r`)
//! - Replies: free text ending with a terminator byte (`>` by default)
//! - Controller temperatures/currents: whitespace-separated numbers, one per
//!   sensor on the board
//! - Controller voltages: three comma-separated `key=value` fields
//! - Low-voltage crate voltages/currents: 16 comma-separated values, the
//!   positive rails of channels 0-7 followed by their negative rails
//!
//! The codec never retries. A failed exchange is reported to the caller,
//! which decides whether the board is dropped or the link is given up.

use crate::error::{ScError, ScResult};
use crate::hardware::link::Session;
use crate::reading::{GainMode, RailPair, VoltageTriple};
use std::fmt;

/// Values in one low-voltage crate reply.
pub const LV_FIELDS: usize = 16;
/// Channels per low-voltage board; negative rails sit at `+LV_CHANNELS`.
pub const LV_CHANNELS: usize = LV_FIELDS / 2;

/// Hardware directives understood by the crates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Controller: sensor temperatures of one interface board
    Temperature(usize),
    /// Controller: positive, negative and bias rails of one interface board
    Voltage(usize),
    /// Controller: SiPM currents of one interface board
    Current(usize),
    /// Controller: amplifier gain mode of one interface board
    Gain(usize),
    /// Low-voltage crate: channel voltages of one board
    LvVoltage(usize),
    /// Low-voltage crate: channel currents of one board
    LvCurrent(usize),
}

impl Command {
    pub fn token(&self) -> String {
        match *self {
            Command::Temperature(board) => format!("$T{board}"),
            Command::Voltage(board) => format!("$U{board}"),
            Command::Current(board) => format!("$I{board}"),
            Command::Gain(board) => format!("$G{board}"),
            Command::LvVoltage(board) => format!("$V{board}"),
            Command::LvCurrent(board) => format!("$C{board}"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// Strip the terminator and any trailing whitespace or control bytes.
fn strip_reply(reply: &str, terminator: char) -> &str {
    reply
        .trim_end_matches(|c: char| c == terminator || c.is_whitespace() || c.is_control())
        .trim_start()
}

fn parse_float(token: &str, what: &str) -> ScResult<f64> {
    token
        .trim()
        .parse::<f64>()
        .map_err(|_| ScError::parse(format!("{what}: '{token}' is not a number")))
}

/// Split a whitespace-delimited list of numbers, keeping each token as the
/// crate printed it. Every token must still parse as a number.
pub fn parse_token_list(reply: &str, terminator: char) -> ScResult<Vec<String>> {
    let body = strip_reply(reply, terminator);
    if body.is_empty() {
        return Err(ScError::parse("empty sensor list"));
    }
    body.split_whitespace()
        .map(|token| parse_float(token, "sensor value").map(|_| token.to_string()))
        .collect()
}

/// Parse a whitespace-delimited list of numbers (temperatures, SiPM currents).
pub fn parse_value_list(reply: &str, terminator: char) -> ScResult<Vec<f64>> {
    let body = strip_reply(reply, terminator);
    if body.is_empty() {
        return Err(ScError::parse("empty sensor list"));
    }
    body.split_whitespace()
        .map(|token| parse_float(token, "sensor value"))
        .collect()
}

#[derive(Clone, Copy)]
enum Rail {
    Positive,
    Negative,
    Bias,
}

fn classify_key(key: &str) -> Option<Rail> {
    let key = key.trim().to_lowercase();
    if key.contains("bias") || key == "vb" || key == "b" {
        Some(Rail::Bias)
    } else if key.contains("neg") || key.contains('-') {
        Some(Rail::Negative)
    } else if key.contains("pos") || key.contains('+') {
        Some(Rail::Positive)
    } else {
        None
    }
}

/// Parse three comma-delimited `key=value` fields into a [`VoltageTriple`].
///
/// Fields may come in any order when each rail is identified by its key
/// (`V+`/`pos*`, `V-`/`neg*`, `Vb`/`bias*`). When no key is recognised the
/// fields are read by position: positive, negative, bias.
pub fn parse_voltage_triple(reply: &str, terminator: char) -> ScResult<VoltageTriple> {
    let body = strip_reply(reply, terminator);
    let fields: Vec<&str> = body
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .collect();
    if fields.len() != 3 {
        return Err(ScError::parse(format!(
            "expected 3 voltage fields, found {}",
            fields.len()
        )));
    }

    let mut pairs = Vec::with_capacity(3);
    for field in fields {
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| ScError::parse(format!("voltage field '{field}' has no '='")))?;
        pairs.push((key, parse_float(value, "voltage")?));
    }

    if pairs.iter().all(|(key, _)| classify_key(key).is_none()) {
        return Ok(VoltageTriple {
            positive: pairs[0].1,
            negative: pairs[1].1,
            bias: pairs[2].1,
        });
    }

    let (mut positive, mut negative, mut bias) = (None, None, None);
    for (key, value) in pairs {
        let slot = match classify_key(key) {
            Some(Rail::Positive) => &mut positive,
            Some(Rail::Negative) => &mut negative,
            Some(Rail::Bias) => &mut bias,
            None => return Err(ScError::parse(format!("unknown voltage key '{key}'"))),
        };
        if slot.replace(value).is_some() {
            return Err(ScError::parse(format!("duplicate voltage key '{key}'")));
        }
    }

    match (positive, negative, bias) {
        (Some(positive), Some(negative), Some(bias)) => Ok(VoltageTriple {
            positive,
            negative,
            bias,
        }),
        _ => Err(ScError::parse("voltage reply is missing a rail")),
    }
}

/// Parse a low-voltage crate reply into eight positive/negative rail pairs.
pub fn parse_lv_rails(reply: &str, terminator: char) -> ScResult<Vec<RailPair>> {
    let body = strip_reply(reply, terminator);
    let values = body
        .split(',')
        .map(|token| parse_float(token, "low-voltage value"))
        .collect::<ScResult<Vec<f64>>>()?;
    if values.len() != LV_FIELDS {
        return Err(ScError::parse(format!(
            "expected {LV_FIELDS} low-voltage values, found {}",
            values.len()
        )));
    }

    Ok((0..LV_CHANNELS)
        .map(|i| RailPair {
            positive: values[i],
            negative: values[i + LV_CHANNELS],
        })
        .collect())
}

/// Parse a gain reply: `0`/`normal` or `1`/`high`.
pub fn parse_gain_mode(reply: &str, terminator: char) -> ScResult<GainMode> {
    let body = strip_reply(reply, terminator);
    let token = body
        .split_whitespace()
        .next()
        .ok_or_else(|| ScError::parse("empty gain reply"))?;
    match token.to_lowercase().as_str() {
        "0" | "n" | "normal" => Ok(GainMode::Normal),
        "1" | "h" | "high" => Ok(GainMode::High),
        other => Err(ScError::parse(format!("unknown gain mode '{other}'"))),
    }
}

fn query<T>(
    session: &mut Session,
    command: Command,
    parse: fn(&str, char) -> ScResult<T>,
) -> ScResult<T> {
    let reply = session.exchange(&command.token())?;
    parse(&reply, session.link().terminator()).map_err(|e| match e {
        ScError::Parse(msg) => {
            ScError::parse(format!("{} reply to {command}: {msg}", session.link().name()))
        }
        other => other,
    })
}

/// Send `command` and return the reply's numeric tokens verbatim.
pub fn read_tokens(session: &mut Session, command: Command) -> ScResult<Vec<String>> {
    query(session, command, parse_token_list)
}

pub fn read_temperatures(session: &mut Session, board: usize) -> ScResult<Vec<f64>> {
    query(session, Command::Temperature(board), parse_value_list)
}

pub fn read_voltages(session: &mut Session, board: usize) -> ScResult<VoltageTriple> {
    query(session, Command::Voltage(board), parse_voltage_triple)
}

pub fn read_currents(session: &mut Session, board: usize) -> ScResult<Vec<f64>> {
    query(session, Command::Current(board), parse_value_list)
}

pub fn read_gain_mode(session: &mut Session, board: usize) -> ScResult<GainMode> {
    query(session, Command::Gain(board), parse_gain_mode)
}

pub fn read_lv_voltages(session: &mut Session, board: usize) -> ScResult<Vec<RailPair>> {
    query(session, Command::LvVoltage(board), parse_lv_rails)
}

pub fn read_lv_currents(session: &mut Session, board: usize) -> ScResult<Vec<RailPair>> {
    query(session, Command::LvCurrent(board), parse_lv_rails)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tokens_embed_board() {
        assert_eq!(Command::Temperature(3).token(), "$T3");
        assert_eq!(Command::Voltage(0).token(), "$U0");
        assert_eq!(Command::Current(5).token(), "$I5");
        assert_eq!(Command::Gain(2).token(), "$G2");
        assert_eq!(Command::LvVoltage(1).token(), "$V1");
        assert_eq!(Command::LvCurrent(0).token(), "$C0");
    }

    #[test]
    fn value_list_strips_terminator() {
        let values = parse_value_list("21.5 22.25  -3.0\r\n>", '>').unwrap();
        assert_eq!(values, vec![21.5, 22.25, -3.0]);
        assert!(parse_value_list(">", '>').is_err());
        assert!(parse_value_list("21.5 hot >", '>').is_err());
    }

    #[test]
    fn voltage_triple_in_any_order() {
        let expected = VoltageTriple {
            positive: 5.125,
            negative: -5.0625,
            bias: 60.5,
        };
        let replies = [
            "V+ = 5.125, V- = -5.0625, Vb = 60.5\r>",
            "Vb=60.5,V+=5.125,V-=-5.0625>",
            "V- = -5.0625 , Vb = 60.5, V+ = 5.125 \n>",
            "neg=-5.0625, bias=60.5, pos=5.125>",
        ];
        for reply in replies {
            assert_eq!(parse_voltage_triple(reply, '>').unwrap(), expected, "{reply}");
        }
    }

    #[test]
    fn voltage_triple_rejects_wrong_shape() {
        assert!(matches!(
            parse_voltage_triple("V+ = 5.0, V- = -5.0\r>", '>'),
            Err(ScError::Parse(_))
        ));
        assert!(parse_voltage_triple("", '>').is_err());
        assert!(parse_voltage_triple("V+ = 5.0, V+ = 5.0, Vb = 60>", '>').is_err());
        assert!(parse_voltage_triple("V+ = 5.0, V- = x, Vb = 60>", '>').is_err());
        assert!(parse_voltage_triple("V+ 5.0, V- = -5, Vb = 60>", '>').is_err());
        assert!(parse_voltage_triple("V+ = 5.0, X = 1, Vb = 60>", '>').is_err());
    }

    #[test]
    fn unrecognised_voltage_keys_fall_back_to_position() {
        let triple = parse_voltage_triple("ch1 = 5.5, ch2 = -5.25, ch3 = 61>", '>').unwrap();
        assert_eq!(
            triple,
            VoltageTriple {
                positive: 5.5,
                negative: -5.25,
                bias: 61.0,
            }
        );
        assert!(parse_voltage_triple("ch1 = 5.5, ch2 = -5.25>", '>').is_err());
        assert!(parse_voltage_triple("ch1 = 5.5, ch2 = low, ch3 = 61>", '>').is_err());
    }

    #[test]
    fn token_list_keeps_crate_formatting() {
        let tokens = parse_token_list("22.50 21.00 -3\r\n>", '>').unwrap();
        assert_eq!(tokens, vec!["22.50", "21.00", "-3"]);
        assert!(parse_token_list("22.50 hot>", '>').is_err());
        assert!(parse_token_list("\r\n>", '>').is_err());
    }

    #[test]
    fn lv_rails_interleave_at_fixed_offset() {
        let values: Vec<f64> = (0..16).map(|i| i as f64 * 0.5).collect();
        let reply = format!(
            "{}\r\n>",
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        let rails = parse_lv_rails(&reply, '>').unwrap();
        assert_eq!(rails.len(), 8);
        for (i, rail) in rails.iter().enumerate() {
            assert_eq!(rail.positive, values[i]);
            assert_eq!(rail.negative, values[i + 8]);
        }
    }

    #[test]
    fn lv_rails_require_sixteen_fields() {
        let fifteen = vec!["1.0"; 15].join(",");
        let seventeen = vec!["1.0"; 17].join(",");
        assert!(matches!(parse_lv_rails(&fifteen, '>'), Err(ScError::Parse(_))));
        assert!(matches!(parse_lv_rails(&seventeen, '>'), Err(ScError::Parse(_))));
    }

    #[test]
    fn gain_mode_tokens() {
        assert_eq!(parse_gain_mode("0\r\n>", '>').unwrap(), GainMode::Normal);
        assert_eq!(parse_gain_mode("HIGH>", '>').unwrap(), GainMode::High);
        assert!(parse_gain_mode("7>", '>').is_err());
        assert!(parse_gain_mode(">", '>').is_err());
    }
}
