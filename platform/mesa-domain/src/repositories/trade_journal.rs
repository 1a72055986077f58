use crate::value_objects::journal::JournalRecord;

/// Append-only persistence of ENTRY/EXIT lifecycle records.
pub trait TradeJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), String>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryJournal {
    pub records: Vec<JournalRecord>,
}

impl TradeJournal for MemoryJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), String> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Read side of the journal, used to rebuild trades after the fact.
pub trait TradeJournalReader {
    fn read_records(&self, path: &std::path::Path) -> Result<Vec<JournalRecord>, String>;
}
