//! In-memory remote collection for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Page, PageFilter, RemoteAdapter, RemoteError, RemoteRecord};
use crate::models::Fields;

type TimeoutPredicate = Box<dyn Fn(&PageFilter) -> bool + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

#[derive(Default)]
struct State {
    records: Vec<RemoteRecord>,
    next_id: u64,
    clock: i64,
    failures: VecDeque<RemoteError>,
    timeout_when: Option<TimeoutPredicate>,
    calls: CallCounts,
}

impl State {
    fn take_failure(&mut self) -> Result<(), RemoteError> {
        self.failures.pop_front().map_or(Ok(()), Err)
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn position(&self, remote_id: &str) -> Result<usize, RemoteError> {
        self.records
            .iter()
            .position(|record| record.remote_id == remote_id)
            .ok_or_else(|| RemoteError::from_status(404, format!("no record {remote_id}")))
    }
}

/// A remote collection kept in memory. Writes stamp records with a logical
/// clock; scripted failures are returned by the next calls in order.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as if it had been edited remotely.
    pub fn insert(&self, record: RemoteRecord) {
        let mut state = self.state.lock().unwrap();
        state.clock = state.clock.max(record.last_edited);
        state.records.retain(|existing| existing.remote_id != record.remote_id);
        state.records.push(record);
    }

    /// Move the logical clock used to stamp writes.
    pub fn set_clock(&self, now: i64) {
        self.state.lock().unwrap().clock = now;
    }

    /// Make the next call fail with `error`.
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    /// Time out every page fetch whose filter matches.
    pub fn timeout_when(&self, predicate: impl Fn(&PageFilter) -> bool + Send + 'static) {
        self.state.lock().unwrap().timeout_when = Some(Box::new(predicate));
    }

    /// Drop a record without a trace, as a hard delete on the remote side would.
    pub fn remove(&self, remote_id: &str) {
        self.state
            .lock()
            .unwrap()
            .records
            .retain(|record| record.remote_id != remote_id);
    }

    pub fn get(&self, remote_id: &str) -> Option<RemoteRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .iter()
            .find(|record| record.remote_id == remote_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().unwrap().calls
    }
}

#[async_trait]
impl RemoteAdapter for MemoryRemote {
    async fn fetch_page(
        &self,
        filter: &PageFilter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.fetch += 1;
        state.take_failure()?;
        if state
            .timeout_when
            .as_ref()
            .is_some_and(|predicate| predicate(filter))
        {
            return Err(RemoteError::timeout("query timed out"));
        }

        let mut matching = state
            .records
            .iter()
            .filter(|record| filter.contains(record.last_edited))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| {
            b.last_edited
                .cmp(&a.last_edited)
                .then_with(|| a.remote_id.cmp(&b.remote_id))
        });

        let offset = cursor.and_then(|cursor| cursor.parse::<usize>().ok()).unwrap_or(0);
        let end = (offset + page_size).min(matching.len());
        let has_more = end < matching.len();
        Ok(Page {
            records: matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default(),
            next_cursor: has_more.then(|| end.to_string()),
            has_more,
        })
    }

    async fn create(&self, payload: &Fields) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.create += 1;
        state.take_failure()?;
        state.next_id += 1;
        let record = RemoteRecord {
            remote_id: format!("r{}", state.next_id),
            unique_external_id: None,
            fields: payload.clone(),
            last_edited: state.tick(),
            archived: false,
        };
        state.records.push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        remote_id: &str,
        payload: &Fields,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.update += 1;
        state.take_failure()?;
        let index = state.position(remote_id)?;
        let now = state.tick();
        let record = &mut state.records[index];
        for (name, value) in payload {
            record.fields.insert(name.clone(), value.clone());
        }
        record.last_edited = now;
        Ok(record.clone())
    }

    async fn delete(&self, remote_id: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.delete += 1;
        state.take_failure()?;
        let index = state.position(remote_id)?;
        let now = state.tick();
        let record = &mut state.records[index];
        record.archived = true;
        record.last_edited = now;
        Ok(())
    }
}
