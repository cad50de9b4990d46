//! Backup orchestrator - runs one backup tick.
//!
//! A tick walks through `Idle -> Collecting -> (Building) -> Delivering` and
//! ends in `Done` or `Failed`. Every stage is attempted at most once. A
//! failed tick posts a single plain-text notice to the destination channel;
//! if that notice fails too, the error is logged and the tick still ends
//! normally.

use crate::archive::{artifact_file_name, build_archive, ARCHIVE_CONTENT_TYPE};
use crate::config::{DeliveryMode, ScheduleConfig};
use crate::delivery::{Attachment, DeliveryClient, MessageId};
use crate::fs::collector::collect_files;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Where a tick currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickState {
    Idle,
    Collecting,
    Building,
    Delivering,
    Done,
    Failed,
}

/// How a tick ended.
#[derive(Debug)]
pub enum JobOutcome {
    /// The tick has not finished yet
    Pending,

    Delivered {
        message_id: MessageId,
        /// Number of attachments sent
        attachments: usize,
        /// Zip left on disk, in archive mode
        artifact: Option<PathBuf>,
    },

    Failed {
        /// State the tick was in when it failed
        stage: TickState,
        error: String,
        /// Whether the failure notice reached the channel
        notified: bool,
    },
}

/// One backup attempt.
#[derive(Debug)]
pub struct BackupJob {
    pub id: Uuid,
    pub source_dir: PathBuf,
    pub channel_id: String,
    pub started_at: DateTime<Local>,
    pub state: TickState,
    pub outcome: JobOutcome,
}

impl BackupJob {
    pub fn new(config: &ScheduleConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_dir: config.source_dir.clone(),
            channel_id: config.channel_id.clone(),
            started_at: Local::now(),
            state: TickState::Idle,
            outcome: JobOutcome::Pending,
        }
    }

    fn transition(&mut self, next: TickState) {
        debug!(job_id = %self.id, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Delivered { .. })
    }
}

/// A unit of work the scheduler can run once per interval.
#[async_trait]
pub trait Backup: Send + Sync {
    async fn run_tick(&self) -> BackupJob;
}

struct Delivered {
    message_id: MessageId,
    attachments: usize,
    artifact: Option<PathBuf>,
}

/// Collects, packages and delivers save files.
pub struct BackupOrchestrator {
    config: Arc<ScheduleConfig>,
    delivery: Arc<dyn DeliveryClient>,
}

impl BackupOrchestrator {
    pub fn new(config: Arc<ScheduleConfig>, delivery: Arc<dyn DeliveryClient>) -> Self {
        Self { config, delivery }
    }

    async fn execute(&self, job: &mut BackupJob) -> Result<Delivered> {
        job.transition(TickState::Collecting);
        let source_dir = job.source_dir.clone();
        let files = tokio::task::spawn_blocking(move || collect_files(&source_dir)).await??;
        info!(job_id = %job.id, "Collected {} save files", files.len());

        let (attachments, artifact) = match self.config.mode {
            DeliveryMode::Archive => {
                job.transition(TickState::Building);
                let dest = self
                    .config
                    .artifact_dir
                    .join(artifact_file_name(&self.config.game, &job.started_at));
                let artifact =
                    tokio::task::spawn_blocking(move || build_archive(&dest, files)).await??;

                let file = tokio::fs::File::open(&artifact.path)
                    .await
                    .map_err(|e| BackupError::build(&artifact.path, e))?;
                let size = file
                    .metadata()
                    .await
                    .map_err(|e| BackupError::build(&artifact.path, e))?
                    .len();

                let attachment = Attachment {
                    name: artifact.file_name(),
                    content_type: ARCHIVE_CONTENT_TYPE.to_string(),
                    size,
                    file,
                };
                (vec![attachment], Some(artifact.path))
            }
            DeliveryMode::Raw => (files.into_iter().map(Attachment::from).collect(), None),
        };

        job.transition(TickState::Delivering);
        let count = attachments.len();
        let message_id = self
            .delivery
            .send_with_attachments(&job.channel_id, &self.config.caption(), attachments)
            .await?;

        Ok(Delivered {
            message_id,
            attachments: count,
            artifact,
        })
    }

    /// Post a failure notice. Returns whether it was delivered.
    async fn notify_failure(&self, job: &BackupJob, err: &BackupError) -> bool {
        let text = format!("Error backing saved files: {}", err);
        match self.delivery.send_text(&job.channel_id, &text).await {
            Ok(message_id) => {
                debug!(job_id = %job.id, "Posted failure notice {}", message_id);
                true
            }
            Err(e) => {
                error!(job_id = %job.id, "Failed to post failure notice: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl Backup for BackupOrchestrator {
    async fn run_tick(&self) -> BackupJob {
        let mut job = BackupJob::new(&self.config);
        info!(
            job_id = %job.id,
            "Starting backup of {} to channel {}",
            job.source_dir.display(),
            job.channel_id
        );

        match self.execute(&mut job).await {
            Ok(delivered) => {
                job.transition(TickState::Done);
                info!(
                    job_id = %job.id,
                    "Backup delivered as message {} ({} attachments)",
                    delivered.message_id,
                    delivered.attachments
                );
                job.outcome = JobOutcome::Delivered {
                    message_id: delivered.message_id,
                    attachments: delivered.attachments,
                    artifact: delivered.artifact,
                };
            }
            Err(e) => {
                let stage = job.state;
                error!(job_id = %job.id, "Backup failed while {:?}: {}", stage, e);
                job.transition(TickState::Failed);
                let notified = self.notify_failure(&job, &e).await;
                job.outcome = JobOutcome::Failed {
                    stage,
                    error: e.to_string(),
                    notified,
                };
            }
        }

        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Attachments {
            channel: String,
            caption: String,
            names: Vec<String>,
        },
        Text {
            channel: String,
            text: String,
        },
    }

    /// Records every call and optionally fails them.
    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<Call>>,
        contents: Mutex<Vec<Vec<u8>>>,
        fail_attachments: bool,
        fail_text: bool,
    }

    impl RecordingClient {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn texts(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, Call::Text { .. }))
                .collect()
        }

        fn attachment_calls(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Attachments { .. }))
                .count()
        }
    }

    #[async_trait]
    impl DeliveryClient for RecordingClient {
        async fn send_with_attachments(
            &self,
            channel: &str,
            caption: &str,
            attachments: Vec<Attachment>,
        ) -> Result<MessageId> {
            self.calls.lock().unwrap().push(Call::Attachments {
                channel: channel.to_string(),
                caption: caption.to_string(),
                names: attachments.iter().map(|a| a.name.clone()).collect(),
            });
            if self.fail_attachments {
                return Err(BackupError::Delivery("Discord returned 503".into()));
            }

            for mut attachment in attachments {
                let mut content = Vec::new();
                attachment.file.read_to_end(&mut content).await?;
                self.contents.lock().unwrap().push(content);
            }
            Ok(MessageId("900".into()))
        }

        async fn send_text(&self, channel: &str, text: &str) -> Result<MessageId> {
            self.calls.lock().unwrap().push(Call::Text {
                channel: channel.to_string(),
                text: text.to_string(),
            });
            if self.fail_text {
                return Err(BackupError::Delivery("Discord returned 503".into()));
            }
            Ok(MessageId("901".into()))
        }
    }

    fn schedule(source: &Path, artifacts: &Path, mode: DeliveryMode) -> Arc<ScheduleConfig> {
        Arc::new(ScheduleConfig {
            source_dir: source.to_path_buf(),
            channel_id: "42".into(),
            interval: Duration::from_secs(60),
            once: false,
            game: "Valheim".into(),
            mode,
            artifact_dir: artifacts.to_path_buf(),
        })
    }

    fn orchestrator(config: Arc<ScheduleConfig>, client: &Arc<RecordingClient>) -> BackupOrchestrator {
        let delivery: Arc<dyn DeliveryClient> = client.clone();
        BackupOrchestrator::new(config, delivery)
    }

    /// Descriptors this process holds on files under `dir`.
    #[cfg(target_os = "linux")]
    fn open_handles_under(dir: &Path) -> usize {
        let dir = dir.canonicalize().unwrap();
        fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| fs::read_link(entry.ok()?.path()).ok())
            .filter(|target| target.starts_with(&dir))
            .count()
    }

    fn seed_saves(dir: &Path) {
        fs::create_dir_all(dir.join("worlds_local")).unwrap();
        fs::write(dir.join("worlds_local/Midgard.db"), b"world").unwrap();
        fs::write(dir.join("worlds_local/Midgard.fwl"), b"meta").unwrap();
    }

    #[tokio::test]
    async fn test_archive_tick_delivers_zip_and_keeps_it() {
        let source = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();
        seed_saves(source.path());

        let client = Arc::new(RecordingClient::default());
        let orchestrator = orchestrator(
            schedule(source.path(), artifacts.path(), DeliveryMode::Archive),
            &client,
        );

        let job = orchestrator.run_tick().await;
        assert_eq!(job.state, TickState::Done);
        assert!(job.succeeded());

        let artifact = match &job.outcome {
            JobOutcome::Delivered { artifact: Some(path), attachments: 1, .. } => path.clone(),
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(artifact.exists());

        match &client.calls()[..] {
            [Call::Attachments { channel, caption, names }] => {
                assert_eq!(channel, "42");
                assert_eq!(caption, "Backing up all Valheim worlds");
                assert_eq!(names.len(), 1);
                assert!(names[0].starts_with("valheim-backup-"));
                assert!(names[0].ends_with(".zip"));
            }
            other => panic!("unexpected calls: {:?}", other),
        }

        let uploaded = client.contents.lock().unwrap()[0].clone();
        assert_eq!(uploaded, fs::read(&artifact).unwrap());
    }

    #[tokio::test]
    async fn test_raw_tick_sends_every_file() {
        let source = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();
        fs::create_dir(source.path().join("sub")).unwrap();
        fs::write(source.path().join("a.log"), b"top").unwrap();
        fs::write(source.path().join("sub/a.log"), b"nested").unwrap();

        let client = Arc::new(RecordingClient::default());
        let orchestrator = orchestrator(
            schedule(source.path(), artifacts.path(), DeliveryMode::Raw),
            &client,
        );

        let job = orchestrator.run_tick().await;
        assert!(job.succeeded());

        match &client.calls()[..] {
            [Call::Attachments { names, .. }] => {
                assert_eq!(names, &vec!["a.log".to_string(), "a.log".to_string()]);
            }
            other => panic!("unexpected calls: {:?}", other),
        }

        let mut contents = client.contents.lock().unwrap().clone();
        contents.sort();
        assert_eq!(contents, vec![b"nested".to_vec(), b"top".to_vec()]);
        assert_eq!(fs::read_dir(artifacts.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_fails_then_recovers() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("saves");
        let client = Arc::new(RecordingClient::default());
        let orchestrator = orchestrator(
            schedule(&source, root.path(), DeliveryMode::Archive),
            &client,
        );

        let job = orchestrator.run_tick().await;
        assert_eq!(job.state, TickState::Failed);
        match &job.outcome {
            JobOutcome::Failed { stage, notified, .. } => {
                assert_eq!(*stage, TickState::Collecting);
                assert!(*notified);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(client.attachment_calls(), 0);
        assert_eq!(client.texts().len(), 1);

        seed_saves(&source);
        let job = orchestrator.run_tick().await;
        assert_eq!(job.state, TickState::Done);
        assert_eq!(client.attachment_calls(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_posts_one_notice() {
        let source = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();
        seed_saves(source.path());

        let client = Arc::new(RecordingClient {
            fail_attachments: true,
            ..Default::default()
        });
        let orchestrator = orchestrator(
            schedule(source.path(), artifacts.path(), DeliveryMode::Archive),
            &client,
        );

        let job = orchestrator.run_tick().await;
        match &job.outcome {
            JobOutcome::Failed { stage, error, notified } => {
                assert_eq!(*stage, TickState::Delivering);
                assert!(error.contains("503"));
                assert!(*notified);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        match &client.texts()[..] {
            [Call::Text { channel, text }] => {
                assert_eq!(channel, "42");
                assert!(text.starts_with("Error backing saved files:"));
                assert!(text.contains("503"));
            }
            other => panic!("unexpected notices: {:?}", other),
        }

        // the artifact stays behind as a local copy
        assert_eq!(fs::read_dir(artifacts.path()).unwrap().count(), 1);
        #[cfg(target_os = "linux")]
        {
            assert_eq!(open_handles_under(source.path()), 0);
            assert_eq!(open_handles_under(artifacts.path()), 0);
        }
    }

    #[tokio::test]
    async fn test_failed_notice_is_swallowed() {
        let source = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();
        seed_saves(source.path());

        let client = Arc::new(RecordingClient {
            fail_attachments: true,
            fail_text: true,
            ..Default::default()
        });
        let orchestrator = orchestrator(
            schedule(source.path(), artifacts.path(), DeliveryMode::Raw),
            &client,
        );

        for _ in 0..2 {
            let job = orchestrator.run_tick().await;
            assert!(matches!(
                job.outcome,
                JobOutcome::Failed { notified: false, .. }
            ));
        }
        assert_eq!(client.attachment_calls(), 2);
        assert_eq!(client.texts().len(), 2);
    }

    #[tokio::test]
    async fn test_build_failure_skips_delivery() {
        let source = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        seed_saves(source.path());

        let client = Arc::new(RecordingClient::default());
        let orchestrator = orchestrator(
            schedule(
                source.path(),
                &root.path().join("no-such-dir"),
                DeliveryMode::Archive,
            ),
            &client,
        );

        let job = orchestrator.run_tick().await;
        assert!(matches!(
            job.outcome,
            JobOutcome::Failed { stage: TickState::Building, .. }
        ));
        assert_eq!(client.attachment_calls(), 0);
        assert_eq!(client.texts().len(), 1);
        #[cfg(target_os = "linux")]
        assert_eq!(open_handles_under(source.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_file_fails_collection_and_releases_handles() {
        use std::os::unix::fs::PermissionsExt;

        let source = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();
        fs::write(source.path().join("a.db"), b"world").unwrap();
        let locked = source.path().join("z.db");
        fs::write(&locked, b"secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // permission bits do not apply to root
        if fs::File::open(&locked).is_ok() {
            return;
        }

        let client = Arc::new(RecordingClient::default());
        let orchestrator = orchestrator(
            schedule(source.path(), artifacts.path(), DeliveryMode::Archive),
            &client,
        );

        let job = orchestrator.run_tick().await;
        assert_eq!(job.state, TickState::Failed);
        match &job.outcome {
            JobOutcome::Failed { stage, error, notified } => {
                assert_eq!(*stage, TickState::Collecting);
                assert!(error.contains("z.db"));
                assert!(*notified);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(client.attachment_calls(), 0);
        assert_eq!(client.texts().len(), 1);
        assert_eq!(fs::read_dir(artifacts.path()).unwrap().count(), 0);

        // handles opened before the failure are closed with the tick
        #[cfg(target_os = "linux")]
        assert_eq!(open_handles_under(source.path()), 0);

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();
        fs::remove_dir_all(source.path()).unwrap();
    }

    #[tokio::test]
    async fn test_each_tick_is_a_fresh_job() {
        let source = TempDir::new().unwrap();
        let artifacts = TempDir::new().unwrap();
        seed_saves(source.path());

        let client = Arc::new(RecordingClient::default());
        let orchestrator = orchestrator(
            schedule(source.path(), artifacts.path(), DeliveryMode::Raw),
            &client,
        );

        let first = orchestrator.run_tick().await;
        let second = orchestrator.run_tick().await;
        assert_ne!(first.id, second.id);
        assert!(first.succeeded() && second.succeeded());
    }
}
