#![forbid(unsafe_code)]

use anyhow::Result;
use gapfill_domain::{
    format_rfc3339, hash_json, now_utc, DocumentKey, EventRow, JournalEvent, JournalEventType,
    ModelCallRecord, Note, RunId, RunRecord, RunStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ulid::Ulid;

/// Append-only audit trail of runs, notes, model calls and hash-chained events.
pub trait RunJournal {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_run(&self, run: &RunRecord) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn update_run_finished(&self, run_id: RunId, status: RunStatus, outcome: &Value)
        -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &JournalEvent) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn append_note(&self, run_id: RunId, note: &Note) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn append_model_call(
        &self,
        run_id: RunId,
        document: &DocumentKey,
        call: &ModelCallRecord,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self) -> Result<Vec<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_notes_for_run(&self, run_id: RunId) -> Result<Vec<Note>>;
}

/// Journal that accepts and forgets everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJournal;

impl RunJournal for NoopJournal {
    fn migrate(&self) -> Result<()> {
        Ok(())
    }

    fn insert_run(&self, _run: &RunRecord) -> Result<()> {
        Ok(())
    }

    fn update_run_finished(
        &self,
        _run_id: RunId,
        _status: RunStatus,
        _outcome: &Value,
    ) -> Result<()> {
        Ok(())
    }

    fn append_event(&self, _event: &JournalEvent) -> Result<i64> {
        Ok(0)
    }

    fn append_note(&self, _run_id: RunId, _note: &Note) -> Result<()> {
        Ok(())
    }

    fn append_model_call(
        &self,
        _run_id: RunId,
        _document: &DocumentKey,
        _call: &ModelCallRecord,
    ) -> Result<()> {
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        Ok(Vec::new())
    }

    fn get_run(&self, _run_id: RunId) -> Result<Option<RunRecord>> {
        Ok(None)
    }

    fn list_events_for_run(&self, _run_id: RunId) -> Result<Vec<EventRow>> {
        Ok(Vec::new())
    }

    fn list_notes_for_run(&self, _run_id: RunId) -> Result<Vec<Note>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Default)]
struct EventChain {
    prev_event_hash: Option<String>,
}

/// Emits the events of one run, linking each to the hash of the one before.
pub struct EventEmitter<'a> {
    journal: &'a dyn RunJournal,
    run_id: RunId,
    chain: EventChain,
}

impl<'a> EventEmitter<'a> {
    #[must_use]
    pub fn new(journal: &'a dyn RunJournal, run_id: RunId) -> Self {
        Self {
            journal,
            run_id,
            chain: EventChain::default(),
        }
    }

    #[must_use]
    pub fn journal(&self) -> &'a dyn RunJournal {
        self.journal
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// # Errors
    /// Returns an error when hashing fails or the journal rejects the event.
    pub fn emit(
        &mut self,
        document: Option<&DocumentKey>,
        event_type: JournalEventType,
        payload_json: Value,
    ) -> Result<EventRow> {
        let occurred_at = now_utc();
        let payload_hash = hash_json(&payload_json)?;
        let event_id = Ulid::new();

        let material = json!({
            "event_id": event_id,
            "run_id": self.run_id,
            "document": document,
            "event_type": event_type,
            "occurred_at": format_rfc3339(occurred_at)?,
            "payload_hash": payload_hash,
            "prev_event_hash": self.chain.prev_event_hash,
        });
        let event_hash = hash_json(&material)?;

        let event = JournalEvent {
            event_id,
            run_id: self.run_id,
            document: document.cloned(),
            event_type,
            occurred_at,
            payload_json,
            payload_hash,
            prev_event_hash: self.chain.prev_event_hash.clone(),
            event_hash: event_hash.clone(),
        };

        let event_seq = self.journal.append_event(&event)?;
        self.chain.prev_event_hash = Some(event_hash);

        Ok(EventRow { event_seq, event })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainReport {
    pub run_id: RunId,
    pub events: usize,
    pub chain_valid: bool,
    /// Sequence number of the first event that breaks the chain.
    pub first_broken_seq: Option<i64>,
}

/// Recompute payload hashes and verify the event hash chain of a recorded run.
///
/// # Errors
/// Returns an error when journal rows cannot be read.
pub fn verify_chain(journal: &dyn RunJournal, run_id: RunId) -> Result<ChainReport> {
    let events = journal.list_events_for_run(run_id)?;
    let mut prev: Option<String> = None;
    for row in &events {
        let event = &row.event;
        let material = json!({
            "event_id": event.event_id,
            "run_id": event.run_id,
            "document": event.document,
            "event_type": event.event_type,
            "occurred_at": format_rfc3339(event.occurred_at)?,
            "payload_hash": event.payload_hash,
            "prev_event_hash": event.prev_event_hash,
        });
        let intact = event.prev_event_hash == prev
            && hash_json(&event.payload_json)? == event.payload_hash
            && hash_json(&material)? == event.event_hash;
        if !intact {
            return Ok(ChainReport {
                run_id,
                events: events.len(),
                chain_valid: false,
                first_broken_seq: Some(row.event_seq),
            });
        }
        prev = Some(event.event_hash.clone());
    }

    Ok(ChainReport {
        run_id,
        events: events.len(),
        chain_valid: true,
        first_broken_seq: None,
    })
}

#[cfg(test)]
mod tests {
    use super::{verify_chain, EventEmitter, NoopJournal, RunJournal};
    use anyhow::Result;
    use gapfill_domain::{
        DocumentKey, EventRow, JournalEvent, JournalEventType, ModelCallRecord, Note, RunId,
        RunRecord, RunStatus,
    };
    use serde_json::{json, Value};
    use std::cell::RefCell;

    #[derive(Default)]
    struct MemoryJournal {
        events: RefCell<Vec<EventRow>>,
    }

    impl RunJournal for MemoryJournal {
        fn migrate(&self) -> Result<()> {
            Ok(())
        }

        fn insert_run(&self, _run: &RunRecord) -> Result<()> {
            Ok(())
        }

        fn update_run_finished(&self, _: RunId, _: RunStatus, _: &Value) -> Result<()> {
            Ok(())
        }

        fn append_event(&self, event: &JournalEvent) -> Result<i64> {
            let mut events = self.events.borrow_mut();
            let seq = i64::try_from(events.len()).unwrap_or(0) + 1;
            events.push(EventRow {
                event_seq: seq,
                event: event.clone(),
            });
            Ok(seq)
        }

        fn append_note(&self, _: RunId, _: &Note) -> Result<()> {
            Ok(())
        }

        fn append_model_call(&self, _: RunId, _: &DocumentKey, _: &ModelCallRecord) -> Result<()> {
            Ok(())
        }

        fn list_runs(&self) -> Result<Vec<RunRecord>> {
            Ok(Vec::new())
        }

        fn get_run(&self, _: RunId) -> Result<Option<RunRecord>> {
            Ok(None)
        }

        fn list_events_for_run(&self, run_id: RunId) -> Result<Vec<EventRow>> {
            Ok(self
                .events
                .borrow()
                .iter()
                .filter(|row| row.event.run_id == run_id)
                .cloned()
                .collect())
        }

        fn list_notes_for_run(&self, _: RunId) -> Result<Vec<Note>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn emitted_events_form_a_verifiable_chain() {
        let journal = MemoryJournal::default();
        let run_id = RunId::new();
        let document = DocumentKey::new("financials-quarterly-income");
        let mut emitter = EventEmitter::new(&journal, run_id);
        for event_type in [
            JournalEventType::RunStarted,
            JournalEventType::DocumentStarted,
            JournalEventType::RunFinished,
        ] {
            let emitted = emitter.emit(Some(&document), event_type, json!({"k": "v"}));
            assert!(emitted.is_ok());
        }

        let report = verify_chain(&journal, run_id).unwrap_or_else(|err| panic!("{err}"));
        assert!(report.chain_valid);
        assert_eq!(report.events, 3);

        journal.events.borrow_mut()[1].event.payload_json = json!({"k": "tampered"});
        let report = verify_chain(&journal, run_id).unwrap_or_else(|err| panic!("{err}"));
        assert!(!report.chain_valid);
        assert_eq!(report.first_broken_seq, Some(2));
    }

    #[test]
    fn noop_journal_accepts_events() {
        let journal = NoopJournal;
        let mut emitter = EventEmitter::new(&journal, RunId::new());
        assert!(emitter
            .emit(None, JournalEventType::Warning, json!({}))
            .is_ok());
        assert!(journal.list_runs().map(|runs| runs.is_empty()).unwrap_or(false));
    }
}
