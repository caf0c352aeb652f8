//! Credential record kept in a raw flash sector

use embedded_storage::{ReadStorage, Storage};
use esp_storage::{FlashStorage, FlashStorageError};

/// Start of the default partition table's `nvs` region. The probe does not
/// use NVS, so the first sector holds the credential record.
pub const RECORD_OFFSET: u32 = 0x9000;

pub struct FlashBlobStore {
    flash: FlashStorage<'static>,
    offset: u32,
}

impl FlashBlobStore {
    pub fn new(flash: FlashStorage<'static>) -> Self {
        Self {
            flash,
            offset: RECORD_OFFSET,
        }
    }
}

impl probe_core::credentials::BlobStore for FlashBlobStore {
    type Error = FlashStorageError;

    fn read(&mut self, buf: &mut [u8]) -> Result<(), FlashStorageError> {
        ReadStorage::read(&mut self.flash, self.offset, buf)
    }

    /// The sector is erased and rewritten as needed by `FlashStorage`
    fn write(&mut self, bytes: &[u8]) -> Result<(), FlashStorageError> {
        Storage::write(&mut self.flash, self.offset, bytes)
    }
}
