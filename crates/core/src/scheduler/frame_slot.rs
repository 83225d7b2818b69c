use crate::producer::domain::frame_producer::ProducerError;

use super::completion_gate::CompletionGate;

/// What the producer delivered for one index.
#[derive(Debug, PartialEq, Eq)]
pub enum SlotPayload<F> {
    Ready(F),
    Failed(ProducerError),
}

impl<F> From<Result<F, ProducerError>> for SlotPayload<F> {
    fn from(result: Result<F, ProducerError>) -> Self {
        match result {
            Ok(frame) => Self::Ready(frame),
            Err(e) => Self::Failed(e),
        }
    }
}

impl<F> SlotPayload<F> {
    /// The native frame, if any, so it can be handed back to the producer.
    pub fn into_frame(self) -> Option<F> {
        match self {
            Self::Ready(frame) => Some(frame),
            Self::Failed(_) => None,
        }
    }
}

/// Bookkeeping for one requested frame index.
///
/// The slot is pending until its gate is opened by the producer callback;
/// the payload lives inside the gate so the wait and the hand-off share a
/// single lock.
#[derive(Debug)]
pub struct FrameSlot<F> {
    index: usize,
    gate: CompletionGate<SlotPayload<F>>,
}

impl<F> FrameSlot<F> {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            gate: CompletionGate::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn gate(&self) -> &CompletionGate<SlotPayload<F>> {
        &self.gate
    }

    pub fn is_pending(&self) -> bool {
        self.gate.is_pending()
    }
}
