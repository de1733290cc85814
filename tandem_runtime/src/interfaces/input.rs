//! Bookkeeping for a value input: one time-ordered queue per connected
//! source and the `current_data` slot last moved out of each queue.

use tandem_core::{GlobalHandle, Time};

/// One queued value update.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub time: Time,
    pub iteration: i32,
    pub data: Vec<u8>,
}

/// State for a value input and its connected sources.
#[derive(Debug)]
pub struct InputInfo {
    pub id: GlobalHandle,
    /// The publication key this input subscribes to.
    pub key: String,
    pub type_name: String,
    pub units: String,
    /// The subscription requires a matching publication by init time.
    pub required: bool,
    /// Suppress updates whose payload equals the current data.
    pub only_update_on_change: bool,
    /// The sources of the input signals, parallel to the queues below.
    sources: Vec<GlobalHandle>,
    /// Declared `(type, units)` of each source, for conversion lookup.
    source_types: Vec<(String, String)>,
    data_queues: Vec<Vec<DataRecord>>,
    current_data: Vec<Option<DataRecord>>,
}

impl InputInfo {
    pub fn new(id: GlobalHandle, key: &str, type_name: &str, units: &str) -> Self {
        Self {
            id,
            key: key.to_owned(),
            type_name: type_name.to_owned(),
            units: units.to_owned(),
            required: false,
            only_update_on_change: false,
            sources: Vec::new(),
            source_types: Vec::new(),
            data_queues: Vec::new(),
            current_data: Vec::new(),
        }
    }

    pub fn add_source(&mut self, source: GlobalHandle, type_name: &str, units: &str) {
        if self.sources.contains(&source) {
            return;
        }
        self.sources.push(source);
        self.source_types
            .push((type_name.to_owned(), units.to_owned()));
        self.data_queues.push(Vec::new());
        self.current_data.push(None);
    }

    pub fn sources(&self) -> &[GlobalHandle] {
        &self.sources
    }

    pub fn source_type(&self, source: GlobalHandle) -> Option<&(String, String)> {
        let index = self.sources.iter().position(|s| *s == source)?;
        self.source_types.get(index)
    }

    pub fn has_source(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Queue a value update from `source`, keeping the queue non-decreasing
    /// in `(time, iteration)` with FIFO order for equal keys. Updates from
    /// unknown sources are dropped.
    pub fn add_data(&mut self, source: GlobalHandle, time: Time, iteration: i32, data: Vec<u8>) {
        let Some(index) = self.sources.iter().position(|s| *s == source) else {
            return;
        };
        let queue = &mut self.data_queues[index];
        let record = DataRecord {
            time,
            iteration,
            data,
        };
        if queue
            .last()
            .map_or(true, |back| (back.time, back.iteration) <= (time, iteration))
        {
            queue.push(record);
        } else {
            let at = queue
                .partition_point(|r| (r.time, r.iteration) <= (time, iteration));
            queue.insert(at, record);
        }
    }

    /// Advance `current_data` using every record strictly earlier than
    /// `new_time`. Returns true if any value changed.
    pub fn update_time_up_to(&mut self, new_time: Time) -> bool {
        self.update_queues(|records| {
            records.iter().take_while(|r| r.time < new_time).count()
        })
    }

    /// Advance `current_data` using every record at or before `new_time`.
    pub fn update_time_inclusive(&mut self, new_time: Time) -> bool {
        self.update_queues(|records| {
            records.iter().take_while(|r| r.time <= new_time).count()
        })
    }

    /// Advance `current_data` using records strictly earlier than `new_time`
    /// plus the earliest iteration group at `new_time`, so that repeated
    /// calls at the same time step through iterations one group at a time.
    pub fn update_time_next_iteration(&mut self, new_time: Time) -> bool {
        self.update_queues(|records| {
            let before = records.iter().take_while(|r| r.time < new_time).count();
            match records.get(before) {
                Some(first) if first.time == new_time => {
                    let group = first.iteration;
                    before
                        + records[before..]
                            .iter()
                            .take_while(|r| r.time == new_time && r.iteration == group)
                            .count()
                }
                _ => before,
            }
        })
    }

    /// Take `count(records)` records off each queue; the last one taken
    /// becomes the current data (newest wins, intermediates dropped).
    fn update_queues(&mut self, count: impl Fn(&[DataRecord]) -> usize) -> bool {
        let mut updated = false;
        for (index, queue) in self.data_queues.iter_mut().enumerate() {
            let taken = count(queue);
            if taken == 0 {
                continue;
            }
            let mut drained: Vec<DataRecord> = queue.drain(..taken).collect();
            let last = drained.pop().expect("non-zero drain");
            if Self::apply_update(
                &mut self.current_data[index],
                last,
                self.only_update_on_change,
            ) {
                updated = true;
            }
        }
        updated
    }

    fn apply_update(
        current: &mut Option<DataRecord>,
        update: DataRecord,
        only_on_change: bool,
    ) -> bool {
        if !only_on_change {
            *current = Some(update);
            return true;
        }
        match current {
            Some(existing) if existing.data == update.data => {
                if existing.time == update.time {
                    // Bookkeeping only; the value did not change.
                    existing.iteration = update.iteration;
                }
                false
            }
            _ => {
                *current = Some(update);
                true
            }
        }
    }

    /// The earliest queued value time across all sources.
    pub fn next_value_time(&self) -> Time {
        self.data_queues
            .iter()
            .filter_map(|q| q.first().map(|r| r.time))
            .min()
            .unwrap_or(Time::MAX)
    }

    /// The most recent current data across all sources.
    pub fn value(&self) -> Option<&DataRecord> {
        self.current_data
            .iter()
            .flatten()
            .max_by_key(|r| r.time)
    }

    /// Current data for a particular source.
    pub fn value_for(&self, source: GlobalHandle) -> Option<&DataRecord> {
        let index = self.sources.iter().position(|s| *s == source)?;
        self.current_data[index].as_ref()
    }

    /// True when any queued record is due at or before `time`.
    pub fn has_pending(&self, time: Time) -> bool {
        self.next_value_time() <= time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{GlobalFederateId, InterfaceHandle};

    fn handle(fed: i32, hnd: i32) -> GlobalHandle {
        GlobalHandle::new(GlobalFederateId::new(fed), InterfaceHandle::new(hnd))
    }

    fn input_with_source() -> (InputInfo, GlobalHandle) {
        let mut input = InputInfo::new(handle(131_072, 1), "key", "double", "");
        let src = handle(131_073, 1);
        input.add_source(src, "double", "");
        (input, src)
    }

    #[test]
    fn updates_ordered_by_time_then_iteration() {
        let (mut input, src) = input_with_source();
        input.add_data(src, Time::from_seconds(2.0), 0, b"t2".to_vec());
        input.add_data(src, Time::from_seconds(1.0), 1, b"t1i1".to_vec());
        input.add_data(src, Time::from_seconds(1.0), 0, b"t1i0".to_vec());

        assert_eq!(input.next_value_time(), Time::from_seconds(1.0));

        // Strictly-before update at t=1 sees nothing.
        assert!(!input.update_time_up_to(Time::from_seconds(1.0)));
        // Inclusive update takes both t=1 records, newest wins.
        assert!(input.update_time_inclusive(Time::from_seconds(1.0)));
        assert_eq!(input.value().unwrap().data, b"t1i1");
        assert_eq!(input.next_value_time(), Time::from_seconds(2.0));

        assert!(input.update_time_inclusive(Time::from_seconds(2.0)));
        assert_eq!(input.value().unwrap().data, b"t2");
        assert_eq!(input.next_value_time(), Time::MAX);
    }

    #[test]
    fn equal_keys_preserve_insertion_order() {
        let (mut input, src) = input_with_source();
        input.add_data(src, Time::from_seconds(1.0), 0, b"first".to_vec());
        input.add_data(src, Time::from_seconds(1.0), 0, b"second".to_vec());
        // Last write wins under value semantics.
        assert!(input.update_time_inclusive(Time::from_seconds(1.0)));
        assert_eq!(input.value().unwrap().data, b"second");
    }

    #[test]
    fn next_iteration_steps_through_groups() {
        let (mut input, src) = input_with_source();
        let t = Time::from_seconds(1.0);
        input.add_data(src, t, 0, b"i0".to_vec());
        input.add_data(src, t, 1, b"i1".to_vec());
        input.add_data(src, t, 2, b"i2".to_vec());

        assert!(input.update_time_next_iteration(t));
        assert_eq!(input.value().unwrap().data, b"i0");
        assert!(input.update_time_next_iteration(t));
        assert_eq!(input.value().unwrap().data, b"i1");
        assert!(input.update_time_next_iteration(t));
        assert_eq!(input.value().unwrap().data, b"i2");
        assert!(!input.update_time_next_iteration(t));
    }

    #[test]
    fn only_update_on_change_suppresses_equal_payloads() {
        let (mut input, src) = input_with_source();
        input.only_update_on_change = true;
        input.add_data(src, Time::from_seconds(1.0), 0, b"same".to_vec());
        assert!(input.update_time_inclusive(Time::from_seconds(1.0)));

        input.add_data(src, Time::from_seconds(2.0), 0, b"same".to_vec());
        assert!(!input.update_time_inclusive(Time::from_seconds(2.0)));

        input.add_data(src, Time::from_seconds(3.0), 0, b"changed".to_vec());
        assert!(input.update_time_inclusive(Time::from_seconds(3.0)));
        assert_eq!(input.value().unwrap().data, b"changed");
    }

    #[test]
    fn multiple_sources_tracked_separately() {
        let mut input = InputInfo::new(handle(131_072, 1), "key", "double", "");
        let a = handle(131_073, 1);
        let b = handle(131_074, 1);
        input.add_source(a, "double", "");
        input.add_source(b, "int", "");

        input.add_data(a, Time::from_seconds(1.0), 0, b"a1".to_vec());
        input.add_data(b, Time::from_seconds(2.0), 0, b"b2".to_vec());

        assert!(input.update_time_inclusive(Time::from_seconds(2.0)));
        assert_eq!(input.value_for(a).unwrap().data, b"a1");
        assert_eq!(input.value_for(b).unwrap().data, b"b2");
        // The overall value is the newest across sources.
        assert_eq!(input.value().unwrap().data, b"b2");
        assert_eq!(input.source_type(b).unwrap().0, "int");
    }

    #[test]
    fn unknown_source_is_dropped() {
        let (mut input, _src) = input_with_source();
        input.add_data(handle(999, 9), Time::from_seconds(1.0), 0, b"x".to_vec());
        assert_eq!(input.next_value_time(), Time::MAX);
    }
}
