// SPDX-License-Identifier: MIT OR Apache-2.0

//! Listfile persistence (spec §6 "Persisted state"): magic bytes, a
//! `CrateConfig` preamble carried as a `SystemEvent`, the raw readout
//! buffers in producer order, and a closing `EndOfFile` system event.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::CrateConfig;
use crate::error::Error;
use crate::frame::{self, SystemEventHeader, SystemEventSubtype};
use crate::transport::TransportKind;

pub const MAGIC_USB: &[u8; 8] = b"MVLC_USB";
pub const MAGIC_ETH: &[u8; 8] = b"MVLC_ETH";

fn write_system_event(
    writer: &mut impl Write,
    subtype: SystemEventSubtype,
    payload: &[u8],
) -> std::io::Result<()> {
    let padded_len = (payload.len() + 3) / 4 * 4;
    let header = frame::encode_system_event_header(SystemEventHeader {
        subtype,
        length: (padded_len / 4) as u32,
    });
    writer.write_all(&header.to_le_bytes())?;
    writer.write_all(payload)?;
    let pad = padded_len - payload.len();
    if pad > 0 {
        writer.write_all(&vec![0u8; pad])?;
    }
    Ok(())
}

/// Writes one run's listfile (spec §4.K: "The listfile preamble is written
/// first" on `start`; closed with `EndOfFile` on `stop`).
pub struct ListfileWriter {
    file: BufWriter<File>,
}

impl ListfileWriter {
    pub fn create(path: &Path, kind: TransportKind, config: &CrateConfig) -> Result<Self, Error> {
        let file = File::create(path)?;
        let mut file = BufWriter::new(file);
        let magic: &[u8; 8] = match kind {
            TransportKind::Usb => MAGIC_USB,
            TransportKind::Eth => MAGIC_ETH,
        };
        file.write_all(magic)?;
        let yaml = config.to_yaml()?;
        write_system_event(&mut file, SystemEventSubtype::CrateConfig, &yaml)?;
        Ok(ListfileWriter { file })
    }

    /// Appends one readout buffer verbatim, in producer order (spec §5
    /// "Ordering guarantees").
    pub fn write_buffer(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub fn write_pause_resume(&mut self, subtype: SystemEventSubtype) -> Result<(), Error> {
        write_system_event(&mut self.file, subtype, &[])?;
        Ok(())
    }

    /// Terminates the file with `EndOfFile` (spec §8 scenario S5) and
    /// flushes. Consumes self so a writer can't be used after closing.
    pub fn close(mut self) -> Result<(), Error> {
        write_system_event(&mut self.file, SystemEventSubtype::EndOfFile, &[])?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn listfile_round_trips_preamble_and_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.mvlclst");

        let config = CrateConfig {
            name: "test".into(),
            ..Default::default()
        };
        let writer = ListfileWriter::create(&path, TransportKind::Eth, &config).unwrap();
        writer.close().unwrap();

        let mut bytes = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut bytes).unwrap();

        assert_eq!(&bytes[..8], MAGIC_ETH);
        let preamble_header = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let decoded = frame::decode_system_event_header(preamble_header).unwrap();
        assert_eq!(decoded.subtype, SystemEventSubtype::CrateConfig);

        let payload_start = 12;
        let payload_len = decoded.length as usize * 4;
        let yaml_bytes = &bytes[payload_start..payload_start + payload_len];
        let trimmed = &yaml_bytes[..yaml_bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1)];
        let round_tripped = CrateConfig::from_yaml(trimmed).unwrap();
        assert_eq!(round_tripped.name, "test");

        let eof_header_start = payload_start + payload_len;
        let eof_header = u32::from_le_bytes(
            bytes[eof_header_start..eof_header_start + 4].try_into().unwrap(),
        );
        assert_eq!(
            frame::decode_system_event_header(eof_header).unwrap().subtype,
            SystemEventSubtype::EndOfFile
        );
    }
}
