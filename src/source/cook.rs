//! Cook API client: downloads per-speaker audio for a detected recording.
//!
//! The recording host exposes three endpoints per recording: the speaker
//! list, the total duration, and the cook job that packages the tracks into
//! a downloadable archive. The job flow is POST to start the cook, GET
//! polling until `complete`, then a download of the cooked file.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::detector::RecordingHandle;
use crate::errors::{PipelineError, Result};
use crate::source::{archive, map_tracks, AudioSource, AudioTrack, SpeakerInfo};

/// Interval between cook-job readiness checks.
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct CookApiClient {
    http: reqwest::Client,
    handle: RecordingHandle,
    cfg: SourceConfig,
    speakers: Mutex<Option<Vec<SpeakerInfo>>>,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    track: u32,
    username: String,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DurationResponse {
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    #[serde(default)]
    job: Option<Job>,
}

#[derive(Debug, Deserialize)]
struct Job {
    #[serde(default)]
    status: String,
    #[serde(rename = "outputFileName")]
    output_file_name: Option<String>,
}

impl CookApiClient {
    pub fn new(http: reqwest::Client, handle: RecordingHandle, cfg: SourceConfig) -> Self {
        Self {
            http,
            handle,
            cfg,
            speakers: Mutex::new(None),
        }
    }

    fn base_url(&self) -> String {
        format!("https://{}", self.handle.source_domain)
    }

    fn job_url(&self) -> String {
        format!(
            "{}/api/v1/recordings/{}/job?key={}",
            self.base_url(),
            self.handle.recording_id,
            self.handle.access_key
        )
    }

    async fn fetch_speakers(&self) -> Result<Vec<SpeakerInfo>> {
        let url = format!(
            "{}/api/v1/recordings/{}/users?key={}",
            self.base_url(),
            self.handle.recording_id,
            self.handle.access_key
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::Acquisition(format!("speaker list request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Acquisition(format!("speaker list read failed: {e}")))?;

        if !status.is_success() {
            return Err(PipelineError::Acquisition(format!(
                "speaker list returned HTTP {status}: {}",
                truncate(&body, 200)
            )));
        }

        let parsed: UsersResponse = serde_json::from_str(&body)
            .map_err(|e| PipelineError::Acquisition(format!("speaker list parse failed: {e}")))?;

        let speakers: Vec<SpeakerInfo> = parsed
            .users
            .into_iter()
            .map(|user| SpeakerInfo {
                track_index: user.track,
                display_name: user.username,
                user_id: user.id.and_then(|id| id.parse().ok()).unwrap_or(0),
            })
            .collect();

        if speakers.is_empty() {
            return Err(PipelineError::Acquisition(format!(
                "recording {} has no speakers",
                self.handle.recording_id
            )));
        }

        Ok(speakers)
    }

    /// Recording duration in seconds, used for logging and sanity checks.
    pub async fn recording_duration(&self) -> Result<f64> {
        let url = format!(
            "{}/api/v1/recordings/{}/duration?key={}",
            self.base_url(),
            self.handle.recording_id,
            self.handle.access_key
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::Acquisition(format!("duration request failed: {e}")))?;
        let parsed: DurationResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Acquisition(format!("duration parse failed: {e}")))?;
        Ok(parsed.duration)
    }

    /// POST the cook job. Non-fatal: a job may already be running from a
    /// previous attempt, in which case polling still succeeds.
    async fn start_job(&self) {
        let payload = serde_json::json!({
            "type": "recording",
            "options": {
                "format": self.cfg.format,
                "container": self.cfg.container,
                "dynaudnorm": false,
            },
        });

        info!(
            "Starting cook job for recording {} (format={}, container={})",
            self.handle.recording_id, self.cfg.format, self.cfg.container
        );

        match self.http.post(self.job_url()).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Cook job started (HTTP {})", response.status());
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "Cook job start returned HTTP {status}: {}",
                    truncate(&body, 200)
                );
            }
            Err(err) => {
                warn!("Cook job start request failed (non-fatal): {err}");
            }
        }
    }

    /// Poll the job endpoint until the cook completes, returning the output
    /// file name. The caller bounds this with the acquisition deadline.
    async fn poll_until_complete(&self) -> Result<String> {
        info!(
            "Polling cook job for recording {}",
            self.handle.recording_id
        );

        loop {
            match self.http.get(self.job_url()).send().await {
                Ok(response) if response.status().is_success() => {
                    let parsed: JobResponse = response.json().await.map_err(|e| {
                        PipelineError::Acquisition(format!("job poll parse failed: {e}"))
                    })?;
                    if let Some(job) = parsed.job {
                        debug!("Cook job status: {}", job.status);
                        match job.status.as_str() {
                            "complete" => {
                                let filename = job.output_file_name.ok_or_else(|| {
                                    PipelineError::Acquisition(
                                        "cook job complete but no output file name".to_string(),
                                    )
                                })?;
                                info!("Cook job complete, output: {filename}");
                                return Ok(filename);
                            }
                            "error" | "failed" => {
                                return Err(PipelineError::Acquisition(format!(
                                    "cook job failed with status '{}'",
                                    job.status
                                )));
                            }
                            _ => {}
                        }
                    }
                }
                Ok(response) => {
                    warn!("Cook job poll returned HTTP {}", response.status());
                }
                Err(err) => {
                    warn!("Cook job poll error: {err}");
                }
            }

            sleep(JOB_POLL_INTERVAL).await;
        }
    }

    /// Download the cooked archive with retry on transient failures.
    ///
    /// Retries transport errors, 5xx, 408 and 429 with exponential backoff
    /// (1s, 2s); any other 4xx fails immediately.
    async fn download_archive(&self, filename: &str) -> Result<Vec<u8>> {
        let url = format!("{}/dl/{filename}", self.base_url());
        let max_attempts = self.cfg.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.http.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = response.bytes().await.map_err(|e| {
                            PipelineError::Acquisition(format!("archive read failed: {e}"))
                        })?;
                        debug!("Downloaded {} bytes from {url}", bytes.len());
                        return Ok(bytes.to_vec());
                    }

                    let retryable = status.is_server_error()
                        || status.as_u16() == 408
                        || status.as_u16() == 429;
                    last_error = format!("archive download returned HTTP {status}");
                    if !retryable {
                        return Err(PipelineError::Acquisition(last_error));
                    }
                    warn!(
                        "Download attempt {attempt}/{max_attempts}: HTTP {status} from {url}"
                    );
                }
                Err(err) => {
                    last_error = format!("archive download error: {err}");
                    warn!("Download attempt {attempt}/{max_attempts} failed: {err}");
                }
            }

            if attempt < max_attempts {
                let delay = Duration::from_secs(1 << (attempt - 1));
                sleep(delay).await;
            }
        }

        Err(PipelineError::Acquisition(format!(
            "archive download failed after {max_attempts} attempts: {last_error}"
        )))
    }

    async fn fetch_inner(&self, into: &Path) -> Result<Vec<AudioTrack>> {
        let speakers = self.list_speakers().await?;

        match self.recording_duration().await {
            Ok(duration) => info!(
                "Recording {} duration: {duration:.1}s",
                self.handle.recording_id
            ),
            Err(err) => warn!("Duration lookup failed (non-fatal): {err}"),
        }

        self.start_job().await;
        let filename = self.poll_until_complete().await?;
        let bytes = self.download_archive(&filename).await?;
        let entries = archive::extract_speaker_archive(&bytes, into)?;

        let tracks = map_tracks(entries, &speakers)?;
        info!(
            "Acquired {} tracks for recording {}",
            tracks.len(),
            self.handle.recording_id
        );
        Ok(tracks)
    }
}

#[async_trait]
impl AudioSource for CookApiClient {
    async fn list_speakers(&self) -> Result<Vec<SpeakerInfo>> {
        let mut cached = self.speakers.lock().await;
        if let Some(speakers) = cached.as_ref() {
            return Ok(speakers.clone());
        }
        let speakers = self.fetch_speakers().await?;
        *cached = Some(speakers.clone());
        Ok(speakers)
    }

    async fn fetch(&self, into: &Path) -> Result<Vec<AudioTrack>> {
        let deadline = Duration::from_secs(self.cfg.download_timeout_sec);
        tokio::time::timeout(deadline, self.fetch_inner(into))
            .await
            .map_err(|_| {
                PipelineError::AcquisitionTimeout(format!(
                    "cook+download exceeded {}s for recording {}",
                    self.cfg.download_timeout_sec, self.handle.recording_id
                ))
            })?
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::TriggerKind;

    fn handle() -> RecordingHandle {
        RecordingHandle {
            recording_id: "abc123".to_string(),
            access_key: "k0k0k0".to_string(),
            origin_channel_id: 42,
            trigger: TriggerKind::PanelEdit,
            drive_file_id: None,
            source_domain: "craig.chat".to_string(),
        }
    }

    #[test]
    fn urls_carry_recording_coordinates() {
        let client = CookApiClient::new(reqwest::Client::new(), handle(), SourceConfig::default());
        assert_eq!(
            client.job_url(),
            "https://craig.chat/api/v1/recordings/abc123/job?key=k0k0k0"
        );
    }

    #[test]
    fn users_response_parses_string_ids() {
        let body = r#"{"users":[{"track":1,"username":"alice","id":"99"},{"track":2,"username":"bob"}]}"#;
        let parsed: UsersResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.users.len(), 2);
        assert_eq!(parsed.users[0].id.as_deref(), Some("99"));
        assert!(parsed.users[1].id.is_none());
    }

    #[test]
    fn job_response_tolerates_missing_job() {
        let parsed: JobResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.job.is_none());
    }

    #[tokio::test]
    async fn fetch_times_out_with_acquisition_timeout() {
        let mut cfg = SourceConfig::default();
        cfg.download_timeout_sec = 1;
        // Unroutable address: the speaker-list request hangs or errors slowly
        // enough that the deadline fires first on CI-class machines.
        let mut h = handle();
        h.source_domain = "10.255.255.1".to_string();
        let client = CookApiClient::new(
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap(),
            h,
            cfg,
        );
        let dir = tempfile::tempdir().unwrap();
        let err = client.fetch(dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::AcquisitionTimeout(_) | PipelineError::Acquisition(_)
        ));
    }
}
