//! Persistent probe credentials
//!
//! WiFi credentials, the server address, the device identifier and the two
//! auto-connect flags survive power cycles as one fixed-size blob:
//!
//! Binary format:
//! - presence: 1 byte (bitmask, see [`Presence`])
//! - network name: 32 bytes (UTF-8, NUL padded)
//! - network secret: 32 bytes
//! - server address: 32 bytes
//! - device identifier: 64 bytes
//! - auto-connect to network: 1 byte (0 or 1)
//! - auto-connect to server: 1 byte (0 or 1)
//!
//! A field is only ever read when its presence bit is set. Clearing a field
//! drops the bit and leaves the stale bytes where they are.

use core::str;

use heapless::String;
use log::{debug, error, warn};

use crate::error::{ProbeError, Result};

pub const NETWORK_NAME_LEN: usize = 32;
pub const NETWORK_SECRET_LEN: usize = 32;
pub const SERVER_ADDRESS_LEN: usize = 32;
pub const DEVICE_ID_LEN: usize = 64;

pub type NetworkName = String<NETWORK_NAME_LEN>;
pub type NetworkSecret = String<NETWORK_SECRET_LEN>;
pub type ServerAddress = String<SERVER_ADDRESS_LEN>;
pub type DeviceId = String<DEVICE_ID_LEN>;

const NAME_OFFSET: usize = 1;
const SECRET_OFFSET: usize = NAME_OFFSET + NETWORK_NAME_LEN;
const ADDRESS_OFFSET: usize = SECRET_OFFSET + NETWORK_SECRET_LEN;
const DEVICE_ID_OFFSET: usize = ADDRESS_OFFSET + SERVER_ADDRESS_LEN;
const AUTO_WIFI_OFFSET: usize = DEVICE_ID_OFFSET + DEVICE_ID_LEN;
const AUTO_SERVER_OFFSET: usize = AUTO_WIFI_OFFSET + 1;

/// Size of the persisted blob in bytes (163)
pub const RECORD_SIZE: usize = AUTO_SERVER_OFFSET + 1;

/// Copy `value` into a bounded string, cutting at the last character boundary
/// that fits. Returns whether anything was dropped.
pub fn bounded<const N: usize>(value: &str) -> (String<N>, bool) {
    let mut end = value.len().min(N);
    while !value.is_char_boundary(end) {
        end -= 1;
    }

    let mut out = String::new();
    // `end <= N` so this always fits
    let _ = out.push_str(&value[..end]);
    (out, end < value.len())
}

fn bounded_logged<const N: usize>(field: &str, value: &str) -> String<N> {
    let (out, truncated) = bounded::<N>(value);
    if truncated {
        warn!("{} longer than {} bytes, truncated to '{}'", field, N, out.as_str());
    }
    out
}

/// Which fields of the record hold meaningful values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Presence(u8);

impl Presence {
    pub const NETWORK_NAME: u8 = 0b1000_0000;
    pub const NETWORK_SECRET: u8 = 0b0100_0000;
    pub const SERVER_ADDRESS: u8 = 0b0010_0000;
    pub const DEVICE_ID: u8 = 0b0001_0000;
    pub const AUTO_CONNECT_WIFI: u8 = 0b0000_1000;
    pub const AUTO_CONNECT_SERVER: u8 = 0b0000_0100;

    const KNOWN: u8 = 0b1111_1100;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Unknown low bits are dropped.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::KNOWN)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    pub fn insert(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn remove(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

/// Raw field values. Only meaningful together with a [`Presence`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialsRecord {
    pub network_name: NetworkName,
    pub network_secret: NetworkSecret,
    pub server_address: ServerAddress,
    pub device_id: DeviceId,
    pub auto_connect_wifi: bool,
    pub auto_connect_server: bool,
}

impl CredentialsRecord {
    /// Converts the record and its presence bits to the persisted layout.
    pub fn to_bytes(&self, presence: Presence) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];

        bytes[0] = presence.bits();
        write_field(&mut bytes[NAME_OFFSET..SECRET_OFFSET], &self.network_name);
        write_field(&mut bytes[SECRET_OFFSET..ADDRESS_OFFSET], &self.network_secret);
        write_field(&mut bytes[ADDRESS_OFFSET..DEVICE_ID_OFFSET], &self.server_address);
        write_field(&mut bytes[DEVICE_ID_OFFSET..AUTO_WIFI_OFFSET], &self.device_id);
        bytes[AUTO_WIFI_OFFSET] = self.auto_connect_wifi as u8;
        bytes[AUTO_SERVER_OFFSET] = self.auto_connect_server as u8;

        bytes
    }

    /// Restores a record from the persisted layout.
    ///
    /// A set field whose bytes do not decode (erased flash reads back as
    /// `0xFF`, which is never valid UTF-8) loses its presence bit.
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> (Self, Presence) {
        let mut presence = Presence::from_bits(bytes[0]);
        let mut record = Self::default();

        if let Some(name) = read_field(&bytes[NAME_OFFSET..SECRET_OFFSET]) {
            record.network_name = name;
        } else {
            drop_invalid(&mut presence, Presence::NETWORK_NAME, "network name");
        }

        if let Some(secret) = read_field(&bytes[SECRET_OFFSET..ADDRESS_OFFSET]) {
            record.network_secret = secret;
        } else {
            drop_invalid(&mut presence, Presence::NETWORK_SECRET, "network secret");
        }

        if let Some(address) = read_field(&bytes[ADDRESS_OFFSET..DEVICE_ID_OFFSET]) {
            record.server_address = address;
        } else {
            drop_invalid(&mut presence, Presence::SERVER_ADDRESS, "server address");
        }

        if let Some(device_id) = read_field(&bytes[DEVICE_ID_OFFSET..AUTO_WIFI_OFFSET]) {
            record.device_id = device_id;
        } else {
            drop_invalid(&mut presence, Presence::DEVICE_ID, "device identifier");
        }

        match read_flag(bytes[AUTO_WIFI_OFFSET]) {
            Some(flag) => record.auto_connect_wifi = flag,
            None => drop_invalid(&mut presence, Presence::AUTO_CONNECT_WIFI, "wifi auto-connect"),
        }

        match read_flag(bytes[AUTO_SERVER_OFFSET]) {
            Some(flag) => record.auto_connect_server = flag,
            None => drop_invalid(
                &mut presence,
                Presence::AUTO_CONNECT_SERVER,
                "server auto-connect",
            ),
        }

        (record, presence)
    }
}

fn write_field(dst: &mut [u8], value: &str) {
    let src = value.as_bytes();
    dst[..src.len()].copy_from_slice(src);
}

fn read_field<const N: usize>(src: &[u8]) -> Option<String<N>> {
    let len = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    let text = str::from_utf8(&src[..len]).ok()?;
    let mut out = String::new();
    out.push_str(text).ok()?;
    Some(out)
}

fn read_flag(byte: u8) -> Option<bool> {
    match byte {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

fn drop_invalid(presence: &mut Presence, bit: u8, field: &str) {
    if presence.contains(bit) {
        warn!("Stored {} is unreadable, treating it as unset", field);
        presence.remove(bit);
    }
}

/// Opaque persistence backend holding exactly one credentials blob.
pub trait BlobStore {
    type Error: core::fmt::Debug;

    /// Fill `buf` with the stored blob.
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<(), Self::Error>;

    /// Replace the stored blob with `bytes`.
    fn write(&mut self, bytes: &[u8]) -> core::result::Result<(), Self::Error>;
}

/// RAM-backed blob store. Starts out erased (`0xFF`) like fresh flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamStore {
    bytes: [u8; RECORD_SIZE],
}

impl RamStore {
    pub const fn new() -> Self {
        Self {
            bytes: [0xFF; RECORD_SIZE],
        }
    }

    pub const fn with_bytes(bytes: [u8; RECORD_SIZE]) -> Self {
        Self { bytes }
    }

    pub const fn bytes(&self) -> &[u8; RECORD_SIZE] {
        &self.bytes
    }
}

impl Default for RamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for RamStore {
    type Error = core::convert::Infallible;

    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<(), Self::Error> {
        let len = buf.len().min(RECORD_SIZE);
        buf[..len].copy_from_slice(&self.bytes[..len]);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> core::result::Result<(), Self::Error> {
        let len = bytes.len().min(RECORD_SIZE);
        self.bytes[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }
}

/// Borrowed view of the stored WiFi credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkCredentials<'a> {
    pub name: &'a str,
    pub secret: &'a str,
}

/// Single source of truth for identity and connection settings.
///
/// Every mutation is written through to the backend immediately.
pub struct CredentialStore<B: BlobStore> {
    backend: B,
    record: CredentialsRecord,
    presence: Presence,
}

impl<B: BlobStore> CredentialStore<B> {
    /// Load the stored blob. An unreadable backend yields an empty store.
    pub fn load(mut backend: B) -> Self {
        let mut bytes = [0u8; RECORD_SIZE];
        let (record, presence) = match backend.read(&mut bytes) {
            Ok(()) => CredentialsRecord::from_bytes(&bytes),
            Err(e) => {
                error!("Failed to read stored credentials: {:?}", e);
                (CredentialsRecord::default(), Presence::empty())
            }
        };

        debug!("Loaded credentials, presence bits {:#010b}", presence.bits());

        Self {
            backend,
            record,
            presence,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    pub fn network(&self) -> Option<NetworkCredentials<'_>> {
        let both = Presence::NETWORK_NAME | Presence::NETWORK_SECRET;
        self.presence.contains(both).then(|| NetworkCredentials {
            name: self.record.network_name.as_str(),
            secret: self.record.network_secret.as_str(),
        })
    }

    pub fn server_address(&self) -> Option<&str> {
        self.presence
            .contains(Presence::SERVER_ADDRESS)
            .then_some(self.record.server_address.as_str())
    }

    pub fn device_id(&self) -> Option<&str> {
        self.presence
            .contains(Presence::DEVICE_ID)
            .then_some(self.record.device_id.as_str())
    }

    pub fn auto_connect_wifi(&self) -> bool {
        self.presence.contains(Presence::AUTO_CONNECT_WIFI) && self.record.auto_connect_wifi
    }

    pub fn auto_connect_server(&self) -> bool {
        self.presence.contains(Presence::AUTO_CONNECT_SERVER) && self.record.auto_connect_server
    }

    pub fn set_network(&mut self, name: &str, secret: &str) -> Result<()> {
        let name = bounded_logged("Network name", name);
        let secret = bounded_logged("Network secret", secret);
        self.commit(|record, presence| {
            record.network_name = name;
            record.network_secret = secret;
            presence.insert(Presence::NETWORK_NAME | Presence::NETWORK_SECRET);
        })
    }

    pub fn clear_network(&mut self) -> Result<()> {
        self.commit(|_, presence| {
            presence.remove(Presence::NETWORK_NAME | Presence::NETWORK_SECRET);
        })
    }

    pub fn set_server_address(&mut self, address: &str) -> Result<()> {
        let address = bounded_logged("Server address", address);
        self.commit(|record, presence| {
            record.server_address = address;
            presence.insert(Presence::SERVER_ADDRESS);
        })
    }

    pub fn clear_server_address(&mut self) -> Result<()> {
        self.commit(|_, presence| presence.remove(Presence::SERVER_ADDRESS))
    }

    pub fn set_device_id(&mut self, device_id: &str) -> Result<()> {
        let device_id = bounded_logged("Device identifier", device_id);
        self.commit(|record, presence| {
            record.device_id = device_id;
            presence.insert(Presence::DEVICE_ID);
        })
    }

    pub fn clear_device_id(&mut self) -> Result<()> {
        self.commit(|_, presence| presence.remove(Presence::DEVICE_ID))
    }

    /// Set address and identifier together with a single write.
    pub fn set_server_info(&mut self, address: &str, device_id: &str) -> Result<()> {
        let address = bounded_logged("Server address", address);
        let device_id = bounded_logged("Device identifier", device_id);
        self.commit(|record, presence| {
            record.server_address = address;
            record.device_id = device_id;
            presence.insert(Presence::SERVER_ADDRESS | Presence::DEVICE_ID);
        })
    }

    pub fn clear_server_info(&mut self) -> Result<()> {
        self.commit(|_, presence| {
            presence.remove(Presence::SERVER_ADDRESS | Presence::DEVICE_ID);
        })
    }

    pub fn set_auto_connect_wifi(&mut self, enabled: bool) -> Result<()> {
        self.commit(|record, presence| {
            record.auto_connect_wifi = enabled;
            presence.insert(Presence::AUTO_CONNECT_WIFI);
        })
    }

    pub fn set_auto_connect_server(&mut self, enabled: bool) -> Result<()> {
        self.commit(|record, presence| {
            record.auto_connect_server = enabled;
            presence.insert(Presence::AUTO_CONNECT_SERVER);
        })
    }

    /// Apply `change` to a copy, write the copy out and only then adopt it.
    /// A failed write leaves memory matching what is stored.
    fn commit(&mut self, change: impl FnOnce(&mut CredentialsRecord, &mut Presence)) -> Result<()> {
        let mut record = self.record.clone();
        let mut presence = self.presence;
        change(&mut record, &mut presence);

        let bytes = record.to_bytes(presence);
        self.backend.write(&bytes).map_err(|e| {
            error!("Failed to persist credentials: {:?}", e);
            ProbeError::Storage
        })?;

        self.record = record;
        self.presence = presence;
        Ok(())
    }
}
