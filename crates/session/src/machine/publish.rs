//! Resource publication: the primary publish, then sub-devices and the
//! device profile in parallel.

use cl_protocol::{CloudErrorKind, CloudResponse, DeviceResources, PublishScope, Resource};

use super::{Job, PublishJob, Resume, SessionStateMachine};
use crate::correlator::PublishTarget;
use crate::timeout::TimeoutRecord;
use crate::types::{CloudStatus, FailureReason, SessionState, Stage};

impl SessionStateMachine {
    pub(super) fn begin_publish_primary(&mut self) {
        if !self.ctx.signed_in {
            tracing::error!("publish requested before sign-in");
            self.fail_attempt(
                CloudStatus::FailedToPublish,
                FailureReason::SystemError("not signed in".into()),
            );
            return;
        }
        if !self.network.is_attached() {
            self.fail_attempt(
                CloudStatus::FailedToPublish,
                FailureReason::NoInternetConnection,
            );
            return;
        }
        let Some(snapshot) = self.snapshot_for(&PublishTarget::Primary) else {
            self.fail_attempt(
                CloudStatus::FailedToPublish,
                FailureReason::SystemError("no resources to publish".into()),
            );
            return;
        };

        self.set_state(SessionState::Busy(Stage::PublishPrimary));
        self.notify(CloudStatus::Publishing, None);
        let job = PublishJob {
            target: PublishTarget::Primary,
            snapshot,
            malformed_retries: 0,
        };
        let record = self.publish_record();
        self.submit(Job::Publish(job), record);
    }

    fn publish_record(&self) -> TimeoutRecord {
        TimeoutRecord::new(self.config.timeouts.publish_ticks)
    }

    /// Current resources for `target`, or `None` when there is nothing to
    /// publish.
    fn snapshot_for(&self, target: &PublishTarget) -> Option<DeviceResources> {
        match target {
            PublishTarget::Primary => {
                let resources: Vec<Resource> = self
                    .resources
                    .list_resources(PublishScope::Primary)
                    .into_iter()
                    .flat_map(|entry| entry.resources)
                    .collect();
                (!resources.is_empty()).then_some(DeviceResources {
                    device_id: None,
                    resources,
                })
            }
            PublishTarget::SubDevice(id) => self
                .resources
                .list_resources(PublishScope::Secondary)
                .into_iter()
                .find(|entry| entry.device_id.as_deref() == Some(id.as_str()))
                .filter(|entry| !entry.resources.is_empty()),
            PublishTarget::DeviceProfile => self
                .resources
                .list_resources(PublishScope::DeviceProfile)
                .into_iter()
                .find(|entry| !entry.resources.is_empty()),
        }
    }

    pub(super) fn on_publish_response(&mut self, mut job: PublishJob, response: CloudResponse) {
        if response.is_success() {
            self.on_published(job.target);
            return;
        }

        let code = response.error_code();
        tracing::warn!(target = ?job.target, code = %code, "publication rejected");
        match code.kind() {
            CloudErrorKind::DuplicateResource => {
                tracing::info!(target = ?job.target, "resources already published");
                self.on_published(job.target);
            }
            CloudErrorKind::AuthExpired | CloudErrorKind::AuthInvalid => {
                self.refresh_then_retry(Resume::Publish(job), code)
            }
            CloudErrorKind::MalformedRequest => {
                if job.malformed_retries >= self.config.retry.malformed_retry_limit {
                    self.abandon(Job::Publish(job), FailureReason::Cloud(code));
                    return;
                }
                job.malformed_retries += 1;
                if let Some(fresh) = self.snapshot_for(&job.target) {
                    job.snapshot = fresh;
                }
                let record = self.publish_record();
                self.schedule_retry(Job::Publish(job), record, "malformed request");
            }
            CloudErrorKind::NotAcceptable => {
                self.resend_bounded(Job::Publish(job), FailureReason::Cloud(code))
            }
            _ => self.abandon(Job::Publish(job), FailureReason::Cloud(code)),
        }
    }

    fn on_published(&mut self, target: PublishTarget) {
        if !target.is_primary() {
            tracing::info!(target = ?target, "publication complete");
            self.complete_extra(&target);
            return;
        }

        self.ctx.published = true;
        self.ctx.attempt.resends = 0;
        self.ctx.last_keepalive = tokio::time::Instant::now();
        tracing::info!("primary resources published");
        self.notify(CloudStatus::Published, None);
        self.resolve_outcome(true);
        self.begin_extras();
    }

    fn begin_extras(&mut self) {
        let mut jobs = Vec::new();
        for entry in self.resources.list_resources(PublishScope::Secondary) {
            let Some(id) = entry.device_id.clone().filter(|id| !id.trim().is_empty()) else {
                tracing::warn!("skipping sub-device without an id");
                continue;
            };
            if entry.resources.is_empty() {
                tracing::debug!(device_id = %id, "sub-device has no resources");
                continue;
            }
            jobs.push(PublishJob {
                target: PublishTarget::SubDevice(id),
                snapshot: entry,
                malformed_retries: 0,
            });
        }
        if let Some(snapshot) = self.snapshot_for(&PublishTarget::DeviceProfile) {
            jobs.push(PublishJob {
                target: PublishTarget::DeviceProfile,
                snapshot,
                malformed_retries: 0,
            });
        }

        if jobs.is_empty() {
            self.complete_attempt();
            return;
        }

        self.ctx.extras = jobs.iter().map(|job| job.target.clone()).collect();
        self.update_publish_stage();
        for job in jobs {
            if !self.ctx.state.is_busy() {
                break;
            }
            let record = self.publish_record();
            self.submit(Job::Publish(job), record);
        }
    }

    /// Mark one secondary or profile publication settled.
    pub(super) fn complete_extra(&mut self, target: &PublishTarget) {
        self.ctx.extras.remove(target);
        if !matches!(
            self.ctx.state,
            SessionState::Busy(Stage::PublishSecondary | Stage::PublishProfile)
        ) {
            return;
        }
        if self.ctx.extras.is_empty() {
            tracing::info!("publication finished");
            self.complete_attempt();
        } else {
            self.update_publish_stage();
        }
    }

    fn update_publish_stage(&mut self) {
        let stage = if self
            .ctx
            .extras
            .iter()
            .any(|t| matches!(t, PublishTarget::SubDevice(_)))
        {
            Stage::PublishSecondary
        } else {
            Stage::PublishProfile
        };
        self.set_state(SessionState::Busy(stage));
    }

    /// Resubmit a publication after its token was refreshed.
    pub(super) fn resume_publish(&mut self, job: PublishJob) {
        if job.target.is_primary() {
            self.set_state(SessionState::Busy(Stage::PublishPrimary));
        } else {
            self.update_publish_stage();
        }
        let record = self.publish_record();
        self.submit(Job::Publish(job), record);
    }
}
