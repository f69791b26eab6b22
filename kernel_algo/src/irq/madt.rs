//! Walker for the interrupt-controller table handed over by firmware
//!
//! The caller strips the SDT header and passes the table body: an 8 byte
//! header (local controller address + flags) followed by variable-length
//! records. Only record types 0 (local APIC) and 1 (I/O APIC) are
//! interpreted, everything else is reported as [`Record::Other`] so the
//! caller can skip it.

/// Bit 0 of the table flags: a legacy 8259 PIC pair is wired up and must be
/// masked before the I/O controllers are used
pub const FLAG_PCAT_COMPAT: u32 = 1;

const RECORD_LOCAL_APIC: u8 = 0;
const RECORD_IO_APIC: u8 = 1;

/// Bit 0 of a local APIC record's flags: the processor is enabled
pub const LOCAL_APIC_ENABLED: u32 = 1;

pub struct Madt<'a> {
    pub local_ctrl_addr: u32,
    pub flags: u32,
    records: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalApicRecord {
    pub processor_id: u8,
    pub apic_id: u8,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicRecord {
    pub id: u8,
    pub mmio_base: u32,
    pub gsi_base: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    LocalApic(LocalApicRecord),
    IoApic(IoApicRecord),
    Other { typ: u8 },
}

impl<'a> Madt<'a> {
    /// Parse the table body (everything past the SDT header)
    ///
    /// Returns `None` when the body is too short to carry even the 8 byte
    /// local controller header.
    pub fn parse(body: &'a [u8]) -> Option<Self> {
        let header = body.get(..8)?;
        let records = body.get(8..)?;

        // `header` is exactly 8 bytes, these cannot fail
        let local_ctrl_addr = u32_le(header.get(0..4)?);
        let flags = u32_le(header.get(4..8)?);

        Some(Self {
            local_ctrl_addr,
            flags,
            records,
        })
    }

    pub fn supports_8259(&self) -> bool {
        self.flags & FLAG_PCAT_COMPAT != 0
    }

    pub fn records(&self) -> RecordIter<'a> {
        RecordIter { rest: self.records }
    }
}

pub struct RecordIter<'a> {
    rest: &'a [u8],
}

impl Iterator for RecordIter<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let typ = *self.rest.first()?;
        let len = self.rest.get(1).copied().unwrap_or(0) as usize;

        // A record shorter than its own header makes no progress, treat it
        // as the minimum length
        let len = len.max(2);

        // A record extending past the buffer terminates the scan
        let record = self.rest.get(..len)?;
        self.rest = self.rest.get(len..).unwrap_or(&[]);

        let payload = record.get(2..).unwrap_or(&[]);

        Some(match typ {
            RECORD_LOCAL_APIC => match parse_local_apic(payload) {
                Some(rec) => Record::LocalApic(rec),
                None => Record::Other { typ },
            },
            RECORD_IO_APIC => match parse_io_apic(payload) {
                Some(rec) => Record::IoApic(rec),
                None => Record::Other { typ },
            },
            typ => Record::Other { typ },
        })
    }
}

fn parse_local_apic(payload: &[u8]) -> Option<LocalApicRecord> {
    Some(LocalApicRecord {
        processor_id: *payload.first()?,
        apic_id: *payload.get(1)?,
        flags: u32_le(payload.get(2..6)?),
    })
}

fn parse_io_apic(payload: &[u8]) -> Option<IoApicRecord> {
    // Payload: [id, reserved, mmio_base: u32 LE, gsi_base: u32 LE]
    Some(IoApicRecord {
        id: *payload.first()?,
        mmio_base: u32_le(payload.get(2..6)?),
        gsi_base: u32_le(payload.get(6..10)?),
    })
}

fn u32_le(bytes: &[u8]) -> u32 {
    let mut word = [0_u8; 4];
    word.copy_from_slice(bytes);
    u32::from_le_bytes(word)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "No need to be so rigid in tests")]
mod tests {
    use super::*;

    fn table(flags: u32, records: &[u8]) -> Vec<u8> {
        let mut body = vec![];
        body.extend_from_slice(&0xFEE0_0000_u32.to_le_bytes());
        body.extend_from_slice(&flags.to_le_bytes());
        body.extend_from_slice(records);
        body
    }

    fn io_apic_record(id: u8, mmio_base: u32, gsi_base: u32) -> Vec<u8> {
        let mut rec = vec![1, 12, id, 0];
        rec.extend_from_slice(&mmio_base.to_le_bytes());
        rec.extend_from_slice(&gsi_base.to_le_bytes());
        rec
    }

    fn local_apic_record(processor_id: u8, apic_id: u8, flags: u32) -> Vec<u8> {
        let mut rec = vec![0, 8, processor_id, apic_id];
        rec.extend_from_slice(&flags.to_le_bytes());
        rec
    }

    #[test]
    fn test_header() {
        let body = table(FLAG_PCAT_COMPAT, &[]);
        let madt = Madt::parse(&body).unwrap();

        assert_eq!(madt.local_ctrl_addr, 0xFEE0_0000);
        assert!(madt.supports_8259());
        assert_eq!(madt.records().count(), 0);

        // Too short for the header
        assert!(Madt::parse(&[0; 7]).is_none());
    }

    #[test]
    fn test_known_records() {
        let mut records = vec![];
        records.extend_from_slice(&local_apic_record(0, 0, LOCAL_APIC_ENABLED));
        records.extend_from_slice(&local_apic_record(1, 1, 0));
        records.extend_from_slice(&io_apic_record(0, 0xFEC0_0000, 0));

        let body = table(0, &records);
        let madt = Madt::parse(&body).unwrap();
        let records: Vec<Record> = madt.records().collect();

        assert_eq!(
            records,
            vec![
                Record::LocalApic(LocalApicRecord {
                    processor_id: 0,
                    apic_id: 0,
                    flags: LOCAL_APIC_ENABLED,
                }),
                Record::LocalApic(LocalApicRecord {
                    processor_id: 1,
                    apic_id: 1,
                    flags: 0,
                }),
                Record::IoApic(IoApicRecord {
                    id: 0,
                    mmio_base: 0xFEC0_0000,
                    gsi_base: 0,
                }),
            ]
        );
    }

    #[test]
    fn test_unknown_records_skipped() {
        let mut records = vec![];
        records.extend_from_slice(&[9, 4, 0xAA, 0xBB]); // unknown type 9
        records.extend_from_slice(&io_apic_record(1, 0xFEC1_0000, 24));

        let body = table(0, &records);
        let madt = Madt::parse(&body).unwrap();
        let records: Vec<Record> = madt.records().collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0], Record::Other { typ: 9 });
        assert_eq!(
            records[1],
            Record::IoApic(IoApicRecord {
                id: 1,
                mmio_base: 0xFEC1_0000,
                gsi_base: 24,
            })
        );
    }

    #[test]
    fn test_short_record_makes_progress() {
        // A record claiming length 0 would loop forever if taken literally;
        // it must be treated as length 2
        let mut records = vec![7, 0];
        records.extend_from_slice(&io_apic_record(0, 0xFEC0_0000, 0));

        let body = table(0, &records);
        let madt = Madt::parse(&body).unwrap();
        let records: Vec<Record> = madt.records().collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0], Record::Other { typ: 7 });
    }

    #[test]
    fn test_truncated_record_terminates() {
        // Record claims 20 bytes but only 4 remain
        let mut records = vec![];
        records.extend_from_slice(&io_apic_record(0, 0xFEC0_0000, 0));
        records.extend_from_slice(&[1, 20, 0, 0]);

        let body = table(0, &records);
        let madt = Madt::parse(&body).unwrap();

        assert_eq!(madt.records().count(), 1);
    }

    #[test]
    fn test_malformed_known_record_reported_as_other() {
        // Type 1 with too little payload for an I/O APIC record
        let body = table(0, &[1, 4, 0, 0]);
        let madt = Madt::parse(&body).unwrap();
        let records: Vec<Record> = madt.records().collect();

        assert_eq!(records, vec![Record::Other { typ: 1 }]);
    }
}
