//! One entity's rows with an ordered timestamp index

use beacon_types::{
    DeleteOutcome, EntityPruneStats, Page, QueryFilter, Record, RecordId, StoredRecord, Timestamp,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Index key; iterated in reverse this yields newest first, ties by id desc
type IndexKey = (Timestamp, RecordId);

/// Number of page cursors remembered per table
const MAX_CURSORS: usize = 8;

/// Where the previous page of a query left off
#[derive(Debug, Clone)]
struct PageCursor {
    generation: u64,
    filter: Option<QueryFilter>,
    end_offset: usize,
    last_key: IndexKey,
}

#[derive(Debug)]
pub(crate) struct KvTable {
    rows: BTreeMap<RecordId, StoredRecord>,
    by_time: BTreeSet<IndexKey>,
    next_id: RecordId,
    bytes: u64,
    /// Bumped on every mutation; cursors from older generations are stale
    generation: u64,
    cursors: VecDeque<PageCursor>,
}

impl Default for KvTable {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            by_time: BTreeSet::new(),
            next_id: 1,
            bytes: 0,
            generation: 0,
            cursors: VecDeque::new(),
        }
    }
}

impl KvTable {
    /// Rebuild a table from persisted rows
    pub(crate) fn restore(next_id: RecordId, records: Vec<StoredRecord>) -> Self {
        let mut table = Self::default();
        for stored in records {
            table.next_id = table.next_id.max(stored.id + 1);
            table.put(stored);
        }
        table.next_id = table.next_id.max(next_id);
        table
    }

    pub(crate) fn next_id(&self) -> RecordId {
        self.next_id
    }

    pub(crate) fn len(&self) -> u64 {
        self.rows.len() as u64
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &StoredRecord> {
        self.rows.values()
    }

    pub(crate) fn insert(&mut self, record: Record) -> RecordId {
        let id = self.next_id;
        self.next_id += 1;
        self.put(StoredRecord { id, record });
        self.touch();
        id
    }

    pub(crate) fn delete(&mut self, id: RecordId) -> DeleteOutcome {
        if self.take(id) {
            self.touch();
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        }
    }

    pub(crate) fn clear(&mut self) -> u64 {
        let removed = self.len();
        self.rows.clear();
        self.by_time.clear();
        self.bytes = 0;
        self.touch();
        removed
    }

    /// Drop everything older than `cutoff`, then the oldest rows above `max_records`
    pub(crate) fn prune(&mut self, cutoff: Timestamp, max_records: u64) -> EntityPruneStats {
        let expired_keys: Vec<IndexKey> = self
            .by_time
            .range(..(cutoff, RecordId::MIN))
            .copied()
            .collect();
        let expired = self.remove_keys(&expired_keys);

        let surplus = self.len().saturating_sub(max_records) as usize;
        let surplus_keys: Vec<IndexKey> = self.by_time.iter().take(surplus).copied().collect();
        let over_cap = self.remove_keys(&surplus_keys);

        if expired + over_cap > 0 {
            self.touch();
        }
        EntityPruneStats {
            expired,
            over_cap,
            remaining: self.len(),
        }
    }

    pub(crate) fn query(
        &mut self,
        filter: Option<QueryFilter>,
        limit: usize,
        offset: usize,
    ) -> Page {
        let total = match &filter {
            None => self.len(),
            Some(f) => self.rows.values().filter(|r| f.matches(r)).count() as u64,
        };

        let resume = self
            .resume_point(filter.as_ref(), offset)
            .map(|c| (c.end_offset, c.last_key));

        let keys: Box<dyn Iterator<Item = &IndexKey>> = match resume {
            Some((_, last_key)) => Box::new(self.by_time.range(..last_key).rev()),
            None => Box::new(self.by_time.iter().rev()),
        };
        let matching = keys.filter_map(|(_, id)| self.rows.get(id)).filter(|r| match &filter {
            Some(f) => f.matches(r),
            None => true,
        });
        // Without a cursor behind `offset` this walks `offset` rows first
        let skip = match resume {
            Some((end_offset, _)) => offset - end_offset,
            None => offset,
        };
        let records: Vec<StoredRecord> = matching.skip(skip).take(limit).cloned().collect();

        if let Some(last) = records.last() {
            self.remember(PageCursor {
                generation: self.generation,
                filter,
                end_offset: offset.saturating_add(records.len()),
                last_key: (last.timestamp(), last.id),
            });
        }

        Page {
            records,
            total,
            limit,
            offset,
        }
    }

    /// The live cursor closest to, but not past, `offset`
    fn resume_point(&self, filter: Option<&QueryFilter>, offset: usize) -> Option<&PageCursor> {
        self.cursors
            .iter()
            .filter(|c| {
                c.generation == self.generation
                    && c.end_offset <= offset
                    && c.filter.as_ref() == filter
            })
            .max_by_key(|c| c.end_offset)
    }

    fn remember(&mut self, cursor: PageCursor) {
        if self.cursors.len() == MAX_CURSORS {
            self.cursors.pop_front();
        }
        self.cursors.push_back(cursor);
    }

    fn put(&mut self, stored: StoredRecord) {
        self.bytes += stored.record.approximate_size() as u64;
        self.by_time.insert((stored.timestamp(), stored.id));
        if let Some(previous) = self.rows.insert(stored.id, stored) {
            self.by_time.remove(&(previous.timestamp(), previous.id));
            self.bytes = self
                .bytes
                .saturating_sub(previous.record.approximate_size() as u64);
        }
    }

    fn take(&mut self, id: RecordId) -> bool {
        match self.rows.remove(&id) {
            Some(stored) => {
                self.by_time.remove(&(stored.timestamp(), id));
                self.bytes = self
                    .bytes
                    .saturating_sub(stored.record.approximate_size() as u64);
                true
            }
            None => false,
        }
    }

    fn remove_keys(&mut self, keys: &[IndexKey]) -> u64 {
        keys.iter().filter(|(_, id)| self.take(*id)).count() as u64
    }

    fn touch(&mut self) {
        self.generation += 1;
        self.cursors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::{CapturedCall, LoggedError, Severity};

    fn call(url: &str, timestamp: Timestamp) -> Record {
        Record::from(CapturedCall {
            url: url.to_string(),
            method: "POST".into(),
            headers: String::new(),
            payload_size: 0,
            status: 201,
            response_body: String::new(),
            timestamp,
        })
    }

    fn table_with(timestamps: &[Timestamp]) -> KvTable {
        let mut table = KvTable::default();
        for ts in timestamps {
            table.insert(call("https://a.io", *ts));
        }
        table
    }

    #[test]
    fn test_newest_first_with_id_tie_break() {
        let mut table = table_with(&[5, 7, 5]);
        let page = table.query(None, 10, 0);
        let keys: Vec<_> = page.records.iter().map(|r| (r.timestamp(), r.id)).collect();
        assert_eq!(keys, vec![(7, 2), (5, 3), (5, 1)]);
    }

    #[test]
    fn test_cursor_resume_matches_offset_scan() {
        let mut table = table_with(&[3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5]);
        let full = table.query(None, 100, 0).ids();

        let mut walked = Vec::new();
        let mut offset = 0;
        loop {
            let page = table.query(None, 3, offset);
            if page.records.is_empty() {
                break;
            }
            offset += page.records.len();
            walked.extend(page.ids());
        }
        assert_eq!(walked, full);

        // A cold offset with no cursor behind it
        let mut cold = table_with(&[3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5]);
        assert_eq!(cold.query(None, 3, 6).ids(), full[6..9].to_vec());
    }

    #[test]
    fn test_jump_ahead_resumes_from_nearest_cursor() {
        let mut table = table_with(&(0..30).collect::<Vec<_>>());
        let full = table.query(None, 100, 0).ids();

        table.query(None, 4, 0);
        table.query(None, 4, 4);
        let nearest = table.resume_point(None, 13).unwrap();
        assert_eq!(nearest.end_offset, 8);
        assert!(table.resume_point(None, 3).is_none());

        // Skips past the cursor instead of rescanning from the top
        assert_eq!(table.query(None, 5, 13).ids(), full[13..18].to_vec());
        assert_eq!(table.resume_point(None, 20).unwrap().end_offset, 18);

        let filtered = Some(QueryFilter::Url("https://a.io".into()));
        assert!(table.resume_point(filtered.as_ref(), 13).is_none());
    }

    #[test]
    fn test_mutation_invalidates_cursors() {
        let mut table = table_with(&[10, 20, 30, 40]);
        let first = table.query(None, 2, 0);
        assert_eq!(first.ids(), vec![4, 3]);

        // Newer record shifts everything down by one
        table.insert(call("https://a.io", 50));
        let second = table.query(None, 2, 2);
        assert_eq!(second.ids(), vec![3, 2]);
        assert_eq!(second.total, 5);
    }

    #[test]
    fn test_filtered_query_counts_only_matches() {
        let mut table = KvTable::default();
        table.insert(call("https://a.io", 1));
        table.insert(call("https://b.io", 2));
        table.insert(call("https://a.io", 3));

        let page = table.query(Some(QueryFilter::Url("https://a.io".into())), 1, 0);
        assert_eq!(page.total, 2);
        assert_eq!(page.ids(), vec![3]);
        let next = table.query(Some(QueryFilter::Url("https://a.io".into())), 1, 1);
        assert_eq!(next.ids(), vec![1]);
    }

    #[test]
    fn test_prune_two_phases() {
        let mut table = table_with(&(0..20).collect::<Vec<_>>());
        let stats = table.prune(5, 10);
        assert_eq!(stats.expired, 5);
        assert_eq!(stats.over_cap, 5);
        assert_eq!(stats.remaining, 10);

        let oldest = table.query(None, 100, 0).records.last().unwrap().timestamp();
        assert_eq!(oldest, 10);

        let again = table.prune(5, 10);
        assert_eq!(again.removed(), 0);
    }

    #[test]
    fn test_bytes_track_contents() {
        let mut table = KvTable::default();
        let id = table.insert(Record::from(LoggedError {
            message: "boom".into(),
            stack: Some("at main".into()),
            timestamp: 1,
            severity: Severity::Error,
            origin_url: "https://a.io".into(),
        }));
        assert!(table.bytes() > 0);
        assert_eq!(table.delete(id), DeleteOutcome::Deleted);
        assert_eq!(table.bytes(), 0);
        assert_eq!(table.delete(id), DeleteOutcome::NotFound);
    }

    #[test]
    fn test_restore_keeps_id_sequence() {
        let mut table = table_with(&[1, 2, 3]);
        table.delete(3);
        let snapshot: Vec<_> = table.records().cloned().collect();

        let mut restored = KvTable::restore(table.next_id(), snapshot);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.insert(call("https://a.io", 4)), 4);
    }
}
