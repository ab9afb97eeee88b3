//! Minimal btsnoop packet-capture writer (§4.A step "emit to btsnoop", §4.H).
//!
//! Only the well-known record format is implemented: a standard file header
//! followed by one record per logged packet. `turn_on_logging`/
//! `turn_off_logging` (§4.F) install and remove the active logger; with none
//! installed, logging is a no-op.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const BTSNOOP_MAGIC: &[u8; 8] = b"btsnoop\0";
const BTSNOOP_VERSION: u32 = 1;
/// Datalink type for "HCI UART (H4)" framed records.
const BTSNOOP_DATALINK_HCI_H4: u32 = 1002;

/// btsnoop timestamps are microseconds since 0000-01-01, offset from the Unix
/// epoch by this many microseconds.
const BTSNOOP_EPOCH_OFFSET_US: i64 = 0x00E0_3AB4_4A23_9000u64 as i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

pub struct BtSnoopLogger {
    file: File,
}

impl BtSnoopLogger {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut file = File::create(path)?;
        file.write_all(BTSNOOP_MAGIC)?;
        file.write_all(&BTSNOOP_VERSION.to_be_bytes())?;
        file.write_all(&BTSNOOP_DATALINK_HCI_H4.to_be_bytes())?;
        Ok(BtSnoopLogger { file })
    }

    /// Log one H4-framed packet: `h4_type` is the single leading type octet
    /// (COMMAND=1, ACL=2, SCO=3, EVENT=4), `body` is the preamble + payload.
    pub fn log(&mut self, direction: Direction, h4_type: u8, body: &[u8]) -> io::Result<()> {
        let record_len = (body.len() + 1) as u32;
        let flags: u32 = match direction {
            Direction::Incoming => 0x01,
            Direction::Outgoing => 0x00,
        };
        let timestamp_us = now_micros() + BTSNOOP_EPOCH_OFFSET_US;

        self.file.write_all(&record_len.to_be_bytes())?; // original length
        self.file.write_all(&record_len.to_be_bytes())?; // included length
        self.file.write_all(&flags.to_be_bytes())?;
        self.file.write_all(&0u32.to_be_bytes())?; // cumulative drops
        self.file.write_all(&timestamp_us.to_be_bytes())?;
        self.file.write_all(&[h4_type])?;
        self.file.write_all(body)?;
        Ok(())
    }
}

fn now_micros() -> i64 {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    since_epoch.as_micros() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_file_header() {
        let dir = std::env::temp_dir().join("hci_transport_btsnoop_test_header");
        let mut logger = BtSnoopLogger::open(&dir).unwrap();
        logger.log(Direction::Incoming, 4, &[0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00]).unwrap();
        drop(logger);

        let contents = std::fs::read(&dir).unwrap();
        assert_eq!(&contents[0..8], BTSNOOP_MAGIC);
        let _ = std::fs::remove_file(&dir);
    }
}
