//! In-process surface that records what it was asked to show

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::adapter::ClearState;
use crate::model::ButtonStyle;

/// One adapter call
#[derive(Clone, Debug, PartialEq)]
pub enum SurfaceCall {
    /// `set_brightness`
    Brightness(u8),
    /// `clear_surface`
    Clear(ClearState),
    /// `draw_control`
    Draw {
        /// Slot drawn
        slot: String,
        /// Style drawn
        style: ButtonStyle,
        /// Base64 image, if any
        image: Option<String>,
    },
}

#[derive(Debug, Default)]
struct Recorder {
    calls: Mutex<Vec<SurfaceCall>>,
    changed: Notify,
}

/// Virtual surface; clones share one call log
#[derive(Clone, Debug, Default)]
pub struct VirtualSurface {
    recorder: Arc<Recorder>,
}

impl VirtualSurface {
    /// New surface with an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: SurfaceCall) {
        self.recorder.calls.lock().push(call);
        self.recorder.changed.notify_waiters();
    }

    pub(crate) fn set_brightness(&self, percent: u8) {
        self.record(SurfaceCall::Brightness(percent));
    }

    pub(crate) fn clear_surface(&self, state: ClearState) {
        self.record(SurfaceCall::Clear(state));
    }

    pub(crate) fn draw_control(&self, slot_id: &str, style: &ButtonStyle, image: Option<&str>) {
        self.record(SurfaceCall::Draw {
            slot: slot_id.to_string(),
            style: style.clone(),
            image: image.map(str::to_string),
        });
    }

    /// Every call so far
    #[must_use]
    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.recorder.calls.lock().clone()
    }

    /// Most recent draw for a slot
    #[must_use]
    pub fn last_draw(&self, slot_id: &str) -> Option<(ButtonStyle, Option<String>)> {
        self.recorder
            .calls
            .lock()
            .iter()
            .rev()
            .find_map(|call| match call {
                SurfaceCall::Draw { slot, style, image } if slot == slot_id => {
                    Some((style.clone(), image.clone()))
                }
                _ => None,
            })
    }

    /// Forget recorded calls
    pub fn reset(&self) {
        self.recorder.calls.lock().clear();
    }

    /// Wait until `check` holds for the call log; false on timeout
    pub async fn wait_for(&self, timeout: Duration, check: impl Fn(&[SurfaceCall]) -> bool) -> bool {
        let wait = async {
            loop {
                let notified = self.recorder.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if check(self.recorder.calls.lock().as_slice()) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_and_waits() {
        let surface = VirtualSurface::new();
        let writer = surface.clone();

        let waiter = tokio::spawn({
            let surface = surface.clone();
            async move {
                surface
                    .wait_for(Duration::from_secs(2), |calls| {
                        calls.iter().any(|c| matches!(c, SurfaceCall::Draw { slot, .. } if slot == "0x1"))
                    })
                    .await
            }
        });

        writer.clear_surface(ClearState::Blank);
        writer.draw_control("0x1", &ButtonStyle::with_text("Hi"), Some("AAAA"));

        assert!(waiter.await.unwrap());
        let (style, image) = surface.last_draw("0x1").unwrap();
        assert_eq!(style.text, "Hi");
        assert_eq!(image.as_deref(), Some("AAAA"));
        assert_eq!(surface.calls()[0], SurfaceCall::Clear(ClearState::Blank));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let surface = VirtualSurface::new();
        assert!(!surface.wait_for(Duration::from_millis(50), |calls| !calls.is_empty()).await);
    }
}
