use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::RawDetections;

/// Handle an accelerator returns for one accepted submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CompletionToken(pub u64);

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token:{}", self.0)
    }
}

/// One image of a submitted batch: packed RGB24, shared with the frame slot it
/// came from.
#[derive(Clone, Debug)]
pub struct BatchImage {
    pub pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl BatchImage {
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(3))
    }

    /// Non-zero dimensions and a buffer of exactly `width * height * 3` bytes.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.expected_len() == Some(self.pixels.len())
    }
}

/// Invoked once per accepted submission, on a thread owned by the accelerator.
///
/// `Ok` carries one `RawDetections` per submitted image, in submission order.
/// `Err` is a hardware failure for the whole batch.
pub type CompletionCallback = Box<dyn FnOnce(CompletionToken, Result<Vec<RawDetections>>) + Send>;

/// Shared inference device.
///
/// # Contract
///
/// `submit` must not block on inference. It either rejects the batch (an `Err`
/// return; the callback is dropped uncalled) or accepts it and later calls the
/// callback exactly once. The callback may run before `submit` returns.
/// Implementations must accept concurrent submissions from one caller.
pub trait Accelerator: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Queue a batch for inference.
    fn submit(&self, batch: Vec<BatchImage>, on_complete: CompletionCallback)
        -> Result<CompletionToken>;

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
