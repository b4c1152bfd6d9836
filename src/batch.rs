//! Cross-source batch assembly.
//!
//! Once per tick the assembler reads the latest frame of every streaming
//! source and builds one `BatchRequest`. Reads never block and never consume
//! the frame, so a source with no new capture contributes the same sequence
//! again. When more sources are live than the batch cap, admission rotates so
//! every source is serviced within `ceil(live / cap)` submitted batches.
//!
//! Planning and committing are separate steps: `plan` builds a batch without
//! touching rotation state, and `commit` advances the rotation once the batch
//! has actually reached the accelerator. A batch that is never committed
//! leaves the next plan where this one started.

use serde::Serialize;
use std::collections::HashMap;

use crate::frame::FrameSlot;
use crate::source::FrameSource;
use crate::SourceId;

/// Identity of one batch slot: the frame it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SlotTag {
    pub source_id: SourceId,
    pub sequence: u64,
}

impl From<&FrameSlot> for SlotTag {
    fn from(slot: &FrameSlot) -> Self {
        Self {
            source_id: slot.source_id,
            sequence: slot.sequence,
        }
    }
}

/// One batch, at most one slot per source, slots ordered by source id.
#[derive(Clone, Debug)]
pub struct BatchRequest {
    pub request_id: u64,
    pub slots: Vec<FrameSlot>,
}

impl BatchRequest {
    pub fn tags(&self) -> Vec<SlotTag> {
        self.slots.iter().map(SlotTag::from).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub struct BatchAssembler {
    max_batch_size: usize,
    /// Sequence of the slot last admitted per source.
    last_included: HashMap<SourceId, u64>,
    /// Last source admitted in rotation order; the next capped tick starts
    /// after it.
    cursor: Option<SourceId>,
    /// Request id of the last plan and where its rotation ended.
    planned: Option<(u64, SourceId)>,
    next_request_id: u64,
}

impl BatchAssembler {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            last_included: HashMap::new(),
            cursor: None,
            planned: None,
            next_request_id: 1,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Build this tick's batch and commit it at once.
    ///
    /// `sources` must be the streaming set; their order does not matter.
    pub fn assemble<S: FrameSource>(&mut self, sources: &[S]) -> Option<BatchRequest> {
        let batch = self.plan(sources)?;
        self.commit(&batch);
        Some(batch)
    }

    /// Build this tick's batch, or `None` when no source has a frame.
    ///
    /// Rotation and per-source sequence state are left untouched until
    /// `commit` is called with the returned batch.
    pub fn plan<S: FrameSource>(&mut self, sources: &[S]) -> Option<BatchRequest> {
        let mut ordered: Vec<&S> = sources.iter().collect();
        ordered.sort_by_key(|source| source.source_id());
        ordered.dedup_by_key(|source| source.source_id());

        let eligible: Vec<FrameSlot> = ordered
            .iter()
            .filter_map(|source| source.latest())
            .filter(|slot| {
                self.last_included
                    .get(&slot.source_id)
                    .map_or(true, |last| slot.sequence >= *last)
            })
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let start = self
            .cursor
            .and_then(|cursor| eligible.iter().position(|slot| slot.source_id > cursor))
            .unwrap_or(0);
        let take = eligible.len().min(self.max_batch_size);
        let mut slots: Vec<FrameSlot> = (0..take)
            .map(|offset| eligible[(start + offset) % eligible.len()].clone())
            .collect();
        let rotation_end = slots.last().map(|slot| slot.source_id)?;
        if eligible.len() > take {
            log::debug!(
                "BatchAssembler: {} sources eligible, admitting {} from {}",
                eligible.len(),
                take,
                slots[0].source_id
            );
        }
        slots.sort_by_key(|slot| slot.source_id);

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.planned = Some((request_id, rotation_end));
        Some(BatchRequest { request_id, slots })
    }

    /// Record `batch` as delivered to the accelerator.
    ///
    /// Only the most recent plan moves the rotation cursor; committing an
    /// older batch still updates the per-source sequences.
    pub fn commit(&mut self, batch: &BatchRequest) {
        for slot in &batch.slots {
            self.last_included.insert(slot.source_id, slot.sequence);
        }
        match self.planned {
            Some((request_id, rotation_end)) if request_id == batch.request_id => {
                self.cursor = Some(rotation_end);
                self.planned = None;
            }
            _ => log::debug!(
                "BatchAssembler: batch {} is not the latest plan, rotation unchanged",
                batch.request_id
            ),
        }
    }

    /// Drop bookkeeping for a source that will not come back.
    pub fn forget(&mut self, source_id: SourceId) {
        self.last_included.remove(&source_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashSet;

    struct FakeSource {
        id: SourceId,
        sequence: Cell<Option<u64>>,
    }

    impl FakeSource {
        fn new(id: u32, sequence: Option<u64>) -> Self {
            Self {
                id: SourceId(id),
                sequence: Cell::new(sequence),
            }
        }

        fn capture(&self) {
            self.sequence.set(Some(self.sequence.get().unwrap_or(0) + 1));
        }
    }

    impl FrameSource for FakeSource {
        fn source_id(&self) -> SourceId {
            self.id
        }

        fn latest(&self) -> Option<FrameSlot> {
            self.sequence
                .get()
                .map(|sequence| FrameSlot::new(self.id, sequence, vec![0u8; 3], 1, 1))
        }
    }

    fn ids(batch: &BatchRequest) -> Vec<u32> {
        batch.slots.iter().map(|slot| slot.source_id.0).collect()
    }

    #[test]
    fn no_sources_means_no_batch() {
        let mut assembler = BatchAssembler::new(4);
        let sources: Vec<FakeSource> = Vec::new();
        assert!(assembler.assemble(&sources).is_none());
    }

    #[test]
    fn sources_without_frames_are_skipped() {
        let mut assembler = BatchAssembler::new(4);
        let sources = vec![FakeSource::new(0, None), FakeSource::new(1, Some(7))];
        let batch = assembler.assemble(&sources).expect("batch");
        assert_eq!(ids(&batch), vec![1]);
        assert_eq!(batch.slots[0].sequence, 7);
    }

    #[test]
    fn single_source_forms_a_batch_of_one() {
        let mut assembler = BatchAssembler::new(4);
        let sources = vec![FakeSource::new(5, Some(1))];
        let batch = assembler.assemble(&sources).expect("batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.request_id, 1);
    }

    #[test]
    fn slots_are_ordered_by_source_id_and_distinct() {
        let mut assembler = BatchAssembler::new(8);
        let sources = vec![
            FakeSource::new(3, Some(1)),
            FakeSource::new(1, Some(1)),
            FakeSource::new(2, Some(1)),
        ];
        let batch = assembler.assemble(&sources).expect("batch");
        assert_eq!(ids(&batch), vec![1, 2, 3]);
    }

    #[test]
    fn no_new_capture_repeats_the_same_sequence() {
        let mut assembler = BatchAssembler::new(4);
        let sources = vec![FakeSource::new(0, Some(1)), FakeSource::new(1, Some(4))];
        let first = assembler.assemble(&sources).expect("first");
        let second = assembler.assemble(&sources).expect("second");
        assert_eq!(first.tags(), second.tags());
        assert_eq!(second.request_id, first.request_id + 1);

        sources[0].capture();
        let third = assembler.assemble(&sources).expect("third");
        assert_eq!(third.slots[0].sequence, 2);
        assert_eq!(third.slots[1].sequence, 4);
    }

    #[test]
    fn regressed_sequence_is_not_admitted() {
        let mut assembler = BatchAssembler::new(4);
        let sources = vec![FakeSource::new(0, Some(10))];
        assembler.assemble(&sources).expect("batch");
        sources[0].sequence.set(Some(9));
        assert!(assembler.assemble(&sources).is_none());
    }

    #[test]
    fn capped_batches_rotate_over_every_source() {
        let mut assembler = BatchAssembler::new(4);
        let sources: Vec<FakeSource> = (0..6).map(|id| FakeSource::new(id, Some(1))).collect();

        for _ in 0..5 {
            let mut seen = HashSet::new();
            for _ in 0..3 {
                let batch = assembler.assemble(&sources).expect("batch");
                assert_eq!(batch.len(), 4);
                seen.extend(ids(&batch));
                for source in &sources {
                    source.capture();
                }
            }
            assert_eq!(seen.len(), 6);
        }
    }

    #[test]
    fn rotation_sequence_is_predictable() {
        let mut assembler = BatchAssembler::new(4);
        let sources: Vec<FakeSource> = (0..6).map(|id| FakeSource::new(id, Some(1))).collect();
        let first = assembler.assemble(&sources).expect("first");
        let second = assembler.assemble(&sources).expect("second");
        let third = assembler.assemble(&sources).expect("third");
        assert_eq!(ids(&first), vec![0, 1, 2, 3]);
        assert_eq!(ids(&second), vec![0, 1, 4, 5]);
        assert_eq!(ids(&third), vec![2, 3, 4, 5]);
    }

    #[test]
    fn uncommitted_plans_do_not_advance_the_rotation() {
        let mut assembler = BatchAssembler::new(4);
        let sources: Vec<FakeSource> = (0..6).map(|id| FakeSource::new(id, Some(1))).collect();
        let first = assembler.assemble(&sources).expect("first");
        assert_eq!(ids(&first), vec![0, 1, 2, 3]);

        // Planned but never handed to the accelerator.
        for _ in 0..3 {
            let dropped = assembler.plan(&sources).expect("plan");
            assert_eq!(ids(&dropped), vec![0, 1, 4, 5]);
        }

        let second = assembler.plan(&sources).expect("second");
        assert_eq!(ids(&second), vec![0, 1, 4, 5]);
        assembler.commit(&second);
        let third = assembler.assemble(&sources).expect("third");
        assert_eq!(ids(&third), vec![2, 3, 4, 5]);
    }

    #[test]
    fn plan_ids_stay_unique_across_uncommitted_batches() {
        let mut assembler = BatchAssembler::new(2);
        let sources = vec![FakeSource::new(0, Some(1))];
        let a = assembler.plan(&sources).expect("a");
        let b = assembler.plan(&sources).expect("b");
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn batch_never_exceeds_live_count_or_cap() {
        for live in 0..10u32 {
            let mut assembler = BatchAssembler::new(4);
            let sources: Vec<FakeSource> =
                (0..live).map(|id| FakeSource::new(id, Some(1))).collect();
            let size = assembler.assemble(&sources).map_or(0, |batch| batch.len());
            assert_eq!(size, (live as usize).min(4));
        }
    }
}
