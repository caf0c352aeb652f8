//! Serial console: line editing and command parsing
//!
//! Parsing is total: every argument is validated here, so a [`Command`] that
//! reaches the executor can be applied without further checks.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;

use heapless::String as BoundedString;

use crate::credentials::{DeviceId, NetworkName, NetworkSecret, ServerAddress};
use crate::error::{ProbeError, Result};

/// Longest accepted console line in bytes
pub const LINE_CAPACITY: usize = 128;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reading {
    Temperature,
    Humidity,
    SoilMoisture,
    LightLevel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    WifiSet {
        name: NetworkName,
        secret: NetworkSecret,
    },
    WifiConnect,
    WifiDisconnect,
    WifiClear,
    WifiInfo,
    ServerInfo {
        address: ServerAddress,
        device_id: DeviceId,
    },
    IpSet(ServerAddress),
    UuidSet(DeviceId),
    IpClear,
    UuidClear,
    HttpClear,
    SendBegin,
    Get(Reading),
    WifiAutoConnect(bool),
    ServerAutoConnect(bool),
}

/// Name and exact argument count of every command
const COMMANDS: &[(&str, usize)] = &[
    ("wifi-set", 2),
    ("wifi-connect", 0),
    ("wifi-disconnect", 0),
    ("wifi-clear", 0),
    ("wifi-info", 0),
    ("server-info", 2),
    ("ip-set", 1),
    ("uuid-set", 1),
    ("ip-clear", 0),
    ("uuid-clear", 0),
    ("http-clear", 0),
    ("send-begin", 0),
    ("get-temperature", 0),
    ("get-humidity", 0),
    ("get-soil-moisture", 0),
    ("get-light-level", 0),
    ("wifi-autoconnect", 1),
    ("server-autoconnect", 1),
];

impl Command {
    /// Parse one console line. Tokens are separated by whitespace; the first
    /// is the command name and the argument count must match exactly.
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next().ok_or(ProbeError::EmptyCommand)?;
        let args: Vec<&str> = tokens.collect();

        let &(_, expected) = COMMANDS
            .iter()
            .find(|(command, _)| *command == name)
            .ok_or(ProbeError::UnknownCommand)?;
        if args.len() != expected {
            return Err(ProbeError::ArityMismatch {
                expected,
                got: args.len(),
            });
        }

        Ok(match name {
            "wifi-set" => Self::WifiSet {
                name: text(args[0], "ssid longer than 32 bytes")?,
                secret: text(args[1], "password longer than 32 bytes")?,
            },
            "wifi-connect" => Self::WifiConnect,
            "wifi-disconnect" => Self::WifiDisconnect,
            "wifi-clear" => Self::WifiClear,
            "wifi-info" => Self::WifiInfo,
            "server-info" => Self::ServerInfo {
                address: ipv4(args[0])?,
                device_id: text(args[1], "uuid longer than 64 bytes")?,
            },
            "ip-set" => Self::IpSet(ipv4(args[0])?),
            "uuid-set" => Self::UuidSet(text(args[0], "uuid longer than 64 bytes")?),
            "ip-clear" => Self::IpClear,
            "uuid-clear" => Self::UuidClear,
            "http-clear" => Self::HttpClear,
            "send-begin" => Self::SendBegin,
            "get-temperature" => Self::Get(Reading::Temperature),
            "get-humidity" => Self::Get(Reading::Humidity),
            "get-soil-moisture" => Self::Get(Reading::SoilMoisture),
            "get-light-level" => Self::Get(Reading::LightLevel),
            "wifi-autoconnect" => Self::WifiAutoConnect(switch(args[0])?),
            "server-autoconnect" => Self::ServerAutoConnect(switch(args[0])?),
            _ => return Err(ProbeError::UnknownCommand),
        })
    }
}

fn text<const N: usize>(value: &str, too_long: &'static str) -> Result<BoundedString<N>> {
    BoundedString::try_from(value).map_err(|_| ProbeError::InvalidArgument(too_long))
}

fn ipv4(value: &str) -> Result<ServerAddress> {
    value
        .parse::<Ipv4Addr>()
        .map_err(|_| ProbeError::InvalidArgument("not an IPv4 address"))?;
    // A dotted quad is at most 15 bytes
    text(value, "not an IPv4 address")
}

fn switch(value: &str) -> Result<bool> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(ProbeError::InvalidArgument("expected on or off")),
    }
}

/// Successful outcome of a console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Value(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Value(value) => f.write_str(value),
        }
    }
}

/// The text printed back to the operator for a command result
pub fn response_line(result: &Result<Reply>) -> String {
    match result {
        Ok(reply) => alloc::format!("{}", reply),
        Err(e) => alloc::format!("Error: {}", e),
    }
}

/// Byte-at-a-time line assembly for a serial port
#[derive(Debug, Default)]
pub struct LineEditor {
    buf: heapless::Vec<u8, LINE_CAPACITY>,
}

impl LineEditor {
    pub const fn new() -> Self {
        Self {
            buf: heapless::Vec::new(),
        }
    }

    /// Feed one received byte. Returns the finished line on `\n`.
    ///
    /// `\r` is ignored, backspace removes the last byte and bytes past the
    /// capacity are dropped.
    pub fn push(&mut self, byte: u8) -> Option<String> {
        match byte {
            b'\n' => {
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                Some(line)
            }
            b'\r' => None,
            BACKSPACE | DELETE => {
                self.buf.pop();
                None
            }
            other => {
                let _ = self.buf.push(other);
                None
            }
        }
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(editor: &mut LineEditor, bytes: &[u8]) -> Vec<String> {
        bytes.iter().filter_map(|&b| editor.push(b)).collect()
    }

    #[test]
    fn test_parse_every_command() {
        assert_eq!(
            Command::parse("wifi-set HomeNet hunter22"),
            Ok(Command::WifiSet {
                name: NetworkName::try_from("HomeNet").unwrap(),
                secret: NetworkSecret::try_from("hunter22").unwrap(),
            })
        );
        assert_eq!(
            Command::parse("server-info 192.168.1.57 abc-123"),
            Ok(Command::ServerInfo {
                address: ServerAddress::try_from("192.168.1.57").unwrap(),
                device_id: DeviceId::try_from("abc-123").unwrap(),
            })
        );
        assert_eq!(Command::parse("wifi-connect"), Ok(Command::WifiConnect));
        assert_eq!(Command::parse("wifi-info"), Ok(Command::WifiInfo));
        assert_eq!(Command::parse("http-clear"), Ok(Command::HttpClear));
        assert_eq!(Command::parse("send-begin"), Ok(Command::SendBegin));
        assert_eq!(
            Command::parse("get-soil-moisture"),
            Ok(Command::Get(Reading::SoilMoisture))
        );
        assert_eq!(
            Command::parse("server-autoconnect off"),
            Ok(Command::ServerAutoConnect(false))
        );
        assert_eq!(
            Command::parse("  wifi-autoconnect   on "),
            Ok(Command::WifiAutoConnect(true))
        );
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(Command::parse(""), Err(ProbeError::EmptyCommand));
        assert_eq!(Command::parse("   "), Err(ProbeError::EmptyCommand));
        assert_eq!(Command::parse("reboot"), Err(ProbeError::UnknownCommand));
        assert_eq!(
            Command::parse("wifi-set onlyssid"),
            Err(ProbeError::ArityMismatch {
                expected: 2,
                got: 1
            })
        );
        assert_eq!(
            Command::parse("wifi-clear now"),
            Err(ProbeError::ArityMismatch {
                expected: 0,
                got: 1
            })
        );
    }

    #[test]
    fn test_arity_message() {
        let err = Command::parse("ip-set").unwrap_err();
        assert_eq!(
            alloc::format!("{}", err),
            "Wrong argument count: expected 1, got 0"
        );
    }

    #[test]
    fn test_argument_validation() {
        assert!(matches!(
            Command::parse("ip-set 192.168.1"),
            Err(ProbeError::InvalidArgument(_))
        ));
        assert!(matches!(
            Command::parse("ip-set 256.1.1.1"),
            Err(ProbeError::InvalidArgument(_))
        ));
        assert!(matches!(
            Command::parse("wifi-autoconnect yes"),
            Err(ProbeError::InvalidArgument(_))
        ));
        assert!(matches!(
            Command::parse("wifi-autoconnect ON"),
            Err(ProbeError::InvalidArgument(_))
        ));

        let long_ssid = "s".repeat(33);
        assert!(matches!(
            Command::parse(&alloc::format!("wifi-set {} pw", long_ssid)),
            Err(ProbeError::InvalidArgument(_))
        ));
        let max_uuid = "u".repeat(64);
        assert!(Command::parse(&alloc::format!("uuid-set {}", max_uuid)).is_ok());
        assert!(Command::parse(&alloc::format!("uuid-set {}u", max_uuid)).is_err());
    }

    #[test]
    fn test_response_lines() {
        assert_eq!(response_line(&Ok(Reply::Ok)), "OK");
        assert_eq!(response_line(&Ok(Reply::Value("21.50".into()))), "21.50");
        assert_eq!(
            response_line(&Err(ProbeError::SensorNotReady)),
            "Error: Sensor not ready"
        );
    }

    #[test]
    fn test_line_editor() {
        let mut editor = LineEditor::new();

        assert_eq!(feed(&mut editor, b"wifi-conx\x08nect\r\n"), ["wifi-connect"]);
        assert!(editor.pending().is_empty());

        assert_eq!(feed(&mut editor, b"ab\x7f\x7f\x7fc\nd\n"), ["c", "d"]);
        assert_eq!(feed(&mut editor, b"\n"), [""]);
    }

    #[test]
    fn test_line_editor_drops_overflow() {
        let mut editor = LineEditor::new();
        let mut input = Vec::from([b'x'; 200]);
        input.push(b'\n');

        let lines = feed(&mut editor, &input);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), LINE_CAPACITY);
    }
}
