//! Control Runner
//!
//! Turns presses and feedback changes into [`WorkTask`]s. Nothing executes
//! here; the module host drains the tasks for each connection.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{HubError, HubResult};
use crate::model::{ControlStatus, ControlType, WorkPayload, WorkTask};
use crate::rpc::FeedbackUpdate;
use crate::store::Store;

/// Dispatches control input to the work queue
#[derive(Clone, Debug)]
pub struct ControlRunner {
    store: Arc<Store>,
}

impl ControlRunner {
    /// Create a runner over `store`
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Record a press or release and enqueue the matching actions
    ///
    /// Returns the number of work tasks enqueued.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown control, `Unsupported` for control types
    /// that carry no action lists.
    pub fn press_control(&self, control_id: &str, pressed: bool) -> HubResult<usize> {
        let control = self.store.controls.require(control_id)?;

        // Press state is independent of dispatch
        self.store.control_status.upsert(ControlStatus {
            id: control.id.clone(),
            pressed,
        });

        let actions = match control.control_type {
            ControlType::Button => {
                if pressed {
                    control.down_actions
                } else {
                    control.up_actions
                }
            }
            other => {
                return Err(HubError::Unsupported(format!(
                    "press on control type {other:?}"
                )))
            }
        };

        if actions.is_empty() {
            trace!(control_id, pressed, "No actions to run");
            return Ok(0);
        }

        let tasks: Vec<WorkTask> = actions
            .into_iter()
            .map(|entry| {
                WorkTask::new(
                    entry.connection_id,
                    WorkPayload::ExecuteAction {
                        control_id: control.id.clone(),
                        entry_id: entry.id,
                        action_id: entry.action_id,
                        options: entry.options,
                        delay_ms: entry.delay_ms,
                    },
                )
            })
            .collect();
        let count = tasks.len();
        self.store.work_tasks.insert_many(tasks);
        debug!(control_id, pressed, count, "Actions enqueued");
        Ok(count)
    }

    /// Enqueue a feedback create/update for a connection
    ///
    /// # Errors
    ///
    /// `NotFound` if the connection does not exist.
    pub fn updated_feedback(&self, connection_id: &str, feedback: FeedbackUpdate) -> HubResult<()> {
        self.require_connection(connection_id)?;
        self.store.work_tasks.upsert(WorkTask::new(
            connection_id,
            WorkPayload::FeedbackUpdate {
                feedback_id: feedback.feedback_id,
                control_id: feedback.control_id,
                feedback_type: feedback.feedback_type,
                options: feedback.options,
            },
        ));
        Ok(())
    }

    /// Enqueue a feedback removal for a connection
    ///
    /// # Errors
    ///
    /// `NotFound` if the connection does not exist.
    pub fn removed_feedback(&self, connection_id: &str, feedback_id: &str) -> HubResult<()> {
        self.require_connection(connection_id)?;
        self.store.work_tasks.upsert(WorkTask::new(
            connection_id,
            WorkPayload::FeedbackRemove {
                feedback_id: feedback_id.to_string(),
            },
        ));
        Ok(())
    }

    fn require_connection(&self, connection_id: &str) -> HubResult<()> {
        if self.store.connections.contains(connection_id) {
            Ok(())
        } else {
            Err(HubError::not_found("connections", connection_id))
        }
    }
}
