//! Sign-up, sign-in and token refresh.

use chrono::Utc;
use cl_domain::trace::TraceEvent;
use cl_domain::{CloudCredentials, CloudEndpoint};
use cl_protocol::{keys, CloudErrorCode, CloudErrorKind, CloudResponse, ProvisioningData};

use super::{Attempt, Job, Resume, SessionStateMachine};
use crate::types::{CloudStatus, FailureReason, SessionState, Stage};

impl SessionStateMachine {
    /// Begin an attempt from provisioning input.  Input carrying an auth
    /// grant signs up; input without one signs in with saved credentials.
    pub(super) async fn start_attempt(&mut self, data: ProvisioningData) {
        if !self.network.is_attached() {
            tracing::warn!("network down, provisioning request cached");
            self.credentials.cache_pending(data);
            self.set_state(SessionState::Disconnected);
            return;
        }

        self.reset_inflight();
        self.ctx.signed_in = false;
        self.ctx.published = false;
        self.ctx.attempt = Attempt {
            provisioning: Some(data.clone()),
            ..Default::default()
        };

        if data.grant().is_none() {
            self.resume_with_saved_credentials().await;
            return;
        }

        let endpoint = match CloudEndpoint::from_provisioning(
            data.host_name.as_deref(),
            data.ip.as_deref(),
            data.port.as_deref(),
        ) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.fail_attempt(
                    CloudStatus::FailedToRegister,
                    FailureReason::SystemError(e.to_string()),
                );
                return;
            }
        };

        tracing::info!(endpoint = %endpoint, "starting sign-up");
        self.credentials.clear();
        self.ctx.endpoint = Some(endpoint);
        self.begin_sign_up();
    }

    async fn resume_with_saved_credentials(&mut self) {
        let creds = match self.credentials.current().filter(|c| c.has_access_token()) {
            Some(creds) => Some(creds),
            None => match self.credentials.load().await {
                Ok(loaded) => loaded,
                Err(e) => {
                    tracing::warn!(error = %e, "saved credentials unreadable");
                    None
                }
            },
        };

        match creds.filter(|c| c.has_access_token()) {
            Some(creds) => {
                self.ctx.endpoint = Some(creds.endpoint);
                self.begin_sign_in();
            }
            None => self.fail_attempt(
                CloudStatus::FailedToRegister,
                FailureReason::InvalidSavedCredentials,
            ),
        }
    }

    // ── Sign-up ──────────────────────────────────────────────────────

    fn begin_sign_up(&mut self) {
        self.set_state(SessionState::Busy(Stage::SignUp));
        self.notify(CloudStatus::SigningUp, None);
        let record = self.initial_record(&Job::SignUp);
        self.submit(Job::SignUp, record);
    }

    pub(super) async fn on_sign_up_response(&mut self, response: CloudResponse) {
        if response.is_success() {
            let Some(creds) = self.credentials_from_sign_up(&response) else {
                self.fail_attempt(
                    CloudStatus::FailedToRegister,
                    FailureReason::SystemError("no cloud endpoint".into()),
                );
                return;
            };
            if !creds.has_access_token() {
                tracing::warn!("sign-up succeeded without an access token");
                self.fail_attempt(
                    CloudStatus::FailedToRegister,
                    FailureReason::InvalidAccessToken,
                );
                return;
            }

            let user_id = creds.user_id.clone();
            let domain = creds.endpoint.domain().to_string();
            self.credentials.replace(creds);
            if let Err(e) = self.credentials.save().await {
                tracing::error!(error = %e, "failed to persist credentials");
                self.fail_attempt(
                    CloudStatus::FailedToRegister,
                    FailureReason::SystemError(format!("saving credentials: {e}")),
                );
                return;
            }
            TraceEvent::CredentialsStored { user_id, domain }.emit();

            self.notify(CloudStatus::SignedUp, None);
            self.begin_sign_in();
            return;
        }

        let code = response.error_code();
        tracing::warn!(code = %code, "sign-up rejected");
        match code.kind() {
            CloudErrorKind::NotAcceptable | CloudErrorKind::MalformedRequest => {
                self.resend_bounded(Job::SignUp, FailureReason::Cloud(code))
            }
            CloudErrorKind::AuthRejected
            | CloudErrorKind::Forbidden
            | CloudErrorKind::UserNotFound => self.restart_sign_in(code).await,
            _ => self.fail_attempt(CloudStatus::FailedToRegister, FailureReason::Cloud(code)),
        }
    }

    fn credentials_from_sign_up(&self, response: &CloudResponse) -> Option<CloudCredentials> {
        let endpoint = self.ctx.endpoint.clone()?;
        let provisioning = self.ctx.attempt.provisioning.as_ref();
        let text = |key: &str| response.str_field(key).map(str::to_string);

        let mut creds = CloudCredentials {
            endpoint,
            access_token: text(keys::ACCESS_TOKEN).unwrap_or_default(),
            refresh_token: text(keys::REFRESH_TOKEN)
                .or_else(|| provisioning.and_then(|p| p.refresh_token.clone()))
                .unwrap_or_default(),
            token_type: text(keys::TOKEN_TYPE).unwrap_or_else(|| "bearer".into()),
            expires_in: announced_lifetime(response),
            issued_at: Utc::now(),
            user_id: text(keys::USER_ID)
                .or_else(|| provisioning.and_then(|p| p.uid.clone()))
                .unwrap_or_default(),
            server_id: text(keys::SERVER_ID),
            redirect_uri: text(keys::REDIRECT_URI),
            certificate: text(keys::CERTIFICATE),
        };
        creds.follow_redirect();
        Some(creds)
    }

    // ── Sign-in ──────────────────────────────────────────────────────

    pub(super) fn begin_sign_in(&mut self) {
        let Some(creds) = self.credentials.current().filter(|c| c.has_access_token()) else {
            self.fail_attempt(
                CloudStatus::FailedToRegister,
                FailureReason::InvalidAccessToken,
            );
            return;
        };
        self.ctx.endpoint = Some(creds.endpoint);
        self.set_state(SessionState::Busy(Stage::SignIn));
        self.notify(CloudStatus::SigningIn, None);
        let record = self.initial_record(&Job::SignIn);
        self.submit(Job::SignIn, record);
    }

    /// Sign in again after the cloud rejected the account, bounded per
    /// attempt.
    async fn restart_sign_in(&mut self, code: CloudErrorCode) {
        self.ctx.attempt.auth_restarts += 1;
        if self.ctx.attempt.auth_restarts > self.config.retry.auth_restart_limit {
            self.fail_attempt(CloudStatus::FailedToRegister, FailureReason::Cloud(code));
            return;
        }
        tracing::info!(
            code = %code,
            restart = self.ctx.attempt.auth_restarts,
            "restarting sign-in"
        );

        if self.credentials.current().filter(|c| c.has_access_token()).is_none() {
            match self.credentials.load().await {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    self.fail_attempt(
                        CloudStatus::FailedToRegister,
                        FailureReason::InvalidSavedCredentials,
                    );
                    return;
                }
            }
        }
        self.begin_sign_in();
    }

    pub(super) async fn on_sign_in_response(&mut self, response: CloudResponse) {
        if response.is_success() {
            self.ctx.signed_in = true;
            self.ctx.attempt.resends = 0;
            tracing::info!(
                endpoint = ?self.ctx.endpoint.as_ref().map(|e| e.address()),
                "signed in"
            );
            self.notify(CloudStatus::SignedIn, None);
            self.begin_publish_primary();
            return;
        }

        let code = response.error_code();
        tracing::warn!(code = %code, "sign-in rejected");
        match code.kind() {
            CloudErrorKind::AuthExpired | CloudErrorKind::AuthInvalid => {
                self.refresh_then_retry(Resume::SignIn, code)
            }
            CloudErrorKind::AuthRejected | CloudErrorKind::Forbidden => {
                self.restart_sign_in(code).await
            }
            CloudErrorKind::NotAcceptable => {
                self.resend_bounded(Job::SignIn, FailureReason::Cloud(code))
            }
            CloudErrorKind::DeviceNotFound => {
                if let Err(e) = self.credentials.forget().await {
                    tracing::warn!(error = %e, "failed to clear saved credentials");
                }
                self.fail_attempt(CloudStatus::FailedToRegister, FailureReason::Cloud(code));
            }
            _ => self.fail_attempt(CloudStatus::FailedToRegister, FailureReason::Cloud(code)),
        }
    }

    // ── Token refresh ────────────────────────────────────────────────

    /// Refresh the access token; every entry of `resumes` is resubmitted
    /// on success.
    pub(super) fn begin_refresh(&mut self, resumes: Vec<Resume>) {
        self.set_state(SessionState::Busy(Stage::Refresh));
        self.notify(CloudStatus::RefreshingToken, None);
        let job = Job::Refresh { resumes };
        let record = self.initial_record(&job);
        self.submit(job, record);
    }

    /// Refresh, then resubmit `resume`.  Joins the refresh already in
    /// flight, if any, so one refresh serves every rejected request.
    pub(super) fn refresh_then_retry(&mut self, resume: Resume, code: CloudErrorCode) {
        self.ctx.attempt.auth_restarts += 1;
        if self.ctx.attempt.auth_restarts > self.config.retry.auth_restart_limit {
            let job = match resume {
                Resume::SignIn => Job::SignIn,
                Resume::Publish(publish) => Job::Publish(publish),
            };
            self.abandon(job, FailureReason::Cloud(code));
            return;
        }

        let running = self.ctx.inflight.values_mut().find_map(|f| match &mut f.job {
            Job::Refresh { resumes } => Some(resumes),
            _ => None,
        });
        if let Some(resumes) = running {
            tracing::debug!(waiting = resumes.len() + 1, "joining token refresh in flight");
            resumes.push(resume);
            return;
        }
        self.begin_refresh(vec![resume]);
    }

    pub(super) async fn on_refresh_response(
        &mut self,
        resumes: Vec<Resume>,
        response: CloudResponse,
    ) {
        if !response.is_success() {
            let code = response.error_code();
            tracing::warn!(code = %code, "token refresh rejected");
            self.fail_attempt(CloudStatus::FailedToRegister, FailureReason::Cloud(code));
            return;
        }

        let Some(access_token) = response
            .str_field(keys::ACCESS_TOKEN)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
        else {
            self.fail_attempt(
                CloudStatus::FailedToRegister,
                FailureReason::InvalidAccessToken,
            );
            return;
        };

        let previous = self.credentials.current();
        let refresh_token = response
            .str_field(keys::REFRESH_TOKEN)
            .map(str::to_string)
            .or_else(|| previous.as_ref().map(|c| c.refresh_token.clone()))
            .unwrap_or_default();
        let token_type = response
            .str_field(keys::TOKEN_TYPE)
            .map(str::to_string)
            .or_else(|| previous.as_ref().map(|c| c.token_type.clone()))
            .unwrap_or_else(|| "bearer".into());
        let expires_in = announced_lifetime(&response);

        let Some(updated) =
            self.credentials
                .update_tokens(access_token, refresh_token, token_type, expires_in)
        else {
            self.fail_attempt(
                CloudStatus::FailedToRegister,
                FailureReason::InvalidSavedCredentials,
            );
            return;
        };
        if let Err(e) = self.credentials.save().await {
            tracing::error!(error = %e, "failed to persist refreshed credentials");
        }
        tracing::info!(user_id = %updated.user_id, expires_in, "access token refreshed");
        TraceEvent::TokenRefreshed {
            user_id: updated.user_id,
            expires_in,
        }
        .emit();

        if resumes.is_empty() {
            let idle = self.idle_state();
            self.set_state(idle);
            return;
        }
        for resume in resumes {
            if !self.ctx.state.is_busy() {
                break;
            }
            match resume {
                Resume::SignIn => self.begin_sign_in(),
                Resume::Publish(job) => self.resume_publish(job),
            }
        }
    }
}

/// The `expiresin` field, capped to a lifetime date arithmetic can hold.
/// Absent means no announced expiry.
fn announced_lifetime(response: &CloudResponse) -> i64 {
    let raw = response.int_field(keys::EXPIRES_IN).unwrap_or(-1);
    let bounded = CloudCredentials::bounded_lifetime(raw);
    if bounded != raw {
        tracing::warn!(expires_in = raw, "implausible token lifetime, capping");
    }
    bounded
}
