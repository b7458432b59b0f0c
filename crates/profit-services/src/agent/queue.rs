//! Queue agent. Drives the host's batch scheduler through a [`QueueBackend`].
//!
//! Every request runs its scheduler command on its own task, so a slow
//! `qsub` never holds up a poll. Replies carry normalised ids (leading
//! digits); the raw form the scheduler printed is remembered for release
//! and delete.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::{JoinHandle, JoinSet};

use profit_core::config::AgentConfig;
use profit_core::queue::{QueueRequest, QueueResponse};
use profit_core::wire::codes;
use profit_core::StartReply;

use super::backend::{self, normalize_id, QueueBackend};
use super::{Agent, Outbox, Rejection};

pub(crate) struct QueueAgent {
    channel_id: String,
    backend: &'static QueueBackend,
    config: Arc<AgentConfig>,
    poll_interval: Option<Duration>,
    /// Normalised id → id as printed by the submit command.
    raw_ids: Arc<DashMap<String, String>>,
    poller: Option<JoinHandle<()>>,
    tasks: JoinSet<()>,
}

impl QueueAgent {
    pub(crate) async fn start(
        channel_id: String,
        backend: Option<&str>,
        poll_interval: Option<u64>,
        config: &AgentConfig,
    ) -> Result<Self, Rejection> {
        let backend = match backend {
            Some(name) => backend::by_name(name).ok_or_else(|| {
                Rejection::new(codes::QUEUE_COMMAND, format!("unknown queueing system {name}"))
            })?,
            None => backend::detect(config).await.ok_or_else(|| {
                Rejection::new(codes::QUEUE_COMMAND, "no supported queueing system found")
            })?,
        };
        tracing::info!(channel_id, backend = backend.name, "queue agent started");
        Ok(Self {
            channel_id,
            backend,
            config: Arc::new(config.clone()),
            poll_interval: poll_interval
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            raw_ids: Arc::new(DashMap::new()),
            poller: None,
            tasks: JoinSet::new(),
        })
    }

    fn raw(&self, id: &str) -> String {
        self.raw_ids
            .get(id)
            .map(|raw| raw.value().clone())
            .unwrap_or_else(|| id.to_string())
    }
}

fn command_error(transaction_id: Option<String>, reason: String) -> QueueResponse {
    QueueResponse::Error {
        transaction_id,
        reason,
        error_code: codes::QUEUE_COMMAND.into(),
    }
}

fn argv(base: &[&str], extra: impl IntoIterator<Item = String>) -> Vec<String> {
    base.iter().map(|s| s.to_string()).chain(extra).collect()
}

async fn poll(
    config: &AgentConfig,
    backend: &QueueBackend,
    channel_id: &str,
    transaction_id: Option<String>,
) -> QueueResponse {
    match backend::run_command(config, &argv(backend.poll, []), None).await {
        Ok(output) => QueueResponse::Qselect {
            transaction_id,
            channel_id: channel_id.to_string(),
            job_ids: backend.parse_poll(&output),
        },
        Err(reason) => command_error(transaction_id, reason),
    }
}

#[async_trait]
impl Agent for QueueAgent {
    type Request = QueueRequest;

    fn ready(&self) -> StartReply {
        StartReply::Ready {
            channel_id: self.channel_id.clone(),
            remote_path: None,
            backend: Some(self.backend.name.to_string()),
        }
    }

    fn started(&mut self, out: &Outbox) {
        let Some(every) = self.poll_interval else {
            return;
        };
        let out = out.clone();
        let config = self.config.clone();
        let backend = self.backend;
        let channel_id = self.channel_id.clone();
        self.poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match poll(&config, backend, &channel_id, None).await {
                    reply @ QueueResponse::Qselect { .. } => out.send(&reply),
                    QueueResponse::Error { reason, .. } => {
                        tracing::warn!(channel_id, %reason, "scheduler poll failed")
                    }
                    _ => {}
                }
            }
        }));
    }

    async fn handle(&mut self, request: QueueRequest, out: &Outbox) {
        while self.tasks.try_join_next().is_some() {}

        let out = out.clone();
        let config = self.config.clone();
        let backend = self.backend;
        let channel_id = self.channel_id.clone();

        match request {
            QueueRequest::Qsub {
                transaction_id,
                jobs,
                header_lines,
            } => {
                let raw_ids = self.raw_ids.clone();
                self.tasks.spawn(async move {
                    if jobs.is_empty() {
                        return out.send(&command_error(Some(transaction_id), "no jobs to submit".into()));
                    }
                    let script = backend.render_script(&jobs, &header_lines, &config.shell);
                    let submitted =
                        backend::run_command(&config, &argv(backend.submit, []), Some(&script)).await;
                    let reply = match submitted.map(|output| backend.parse_submit(&output)) {
                        Ok(Some(raw)) => match normalize_id(&raw) {
                            Some(job_id) => {
                                tracing::info!(%transaction_id, %job_id, jobs = jobs.len(), "submitted");
                                raw_ids.insert(job_id.clone(), raw);
                                QueueResponse::Qsub {
                                    transaction_id,
                                    channel_id,
                                    job_id,
                                }
                            }
                            None => command_error(
                                Some(transaction_id),
                                format!("unrecognised job id {raw:?}"),
                            ),
                        },
                        Ok(None) => command_error(
                            Some(transaction_id),
                            "submit printed no job id".into(),
                        ),
                        Err(reason) => command_error(Some(transaction_id), reason),
                    };
                    out.send(&reply);
                });
            }
            QueueRequest::Qselect { transaction_id } => {
                self.tasks.spawn(async move {
                    out.send(&poll(&config, backend, &channel_id, transaction_id).await);
                });
            }
            QueueRequest::Qrls {
                transaction_id,
                job_id,
            } => {
                let raw = self.raw(&job_id);
                self.tasks.spawn(async move {
                    let released =
                        backend::run_command(&config, &argv(backend.release, [raw]), None).await;
                    out.send(&match released {
                        Ok(_) => {
                            tracing::debug!(%transaction_id, %job_id, "released");
                            QueueResponse::Qrls {
                                transaction_id,
                                job_id,
                            }
                        }
                        Err(reason) => command_error(Some(transaction_id), reason),
                    });
                });
            }
            QueueRequest::Qdel {
                transaction_id,
                job_ids,
                force,
            } => {
                let raws: Vec<String> = job_ids.iter().map(|id| self.raw(id)).collect();
                let raw_ids = self.raw_ids.clone();
                self.tasks.spawn(async move {
                    if raws.is_empty() {
                        return out.send(&QueueResponse::Qdel {
                            transaction_id,
                            job_ids,
                        });
                    }
                    let mut args: Vec<String> = Vec::new();
                    if force {
                        args.extend(backend.force.iter().map(|s| s.to_string()));
                    }
                    args.extend(raws);
                    let deleted =
                        backend::run_command(&config, &argv(backend.delete, args), None).await;
                    out.send(&match deleted {
                        Ok(_) => {
                            for id in &job_ids {
                                raw_ids.remove(id);
                            }
                            tracing::debug!(%transaction_id, ?job_ids, force, "deleted");
                            QueueResponse::Qdel {
                                transaction_id,
                                job_ids,
                            }
                        }
                        Err(reason) => command_error(Some(transaction_id), reason),
                    });
                });
            }
        }
    }

    async fn shutdown(&mut self, _out: &Outbox) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "queue task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profit_core::wire::{decode, Inbound};
    use tokio::sync::mpsc;

    use super::super::Frame;

    /// A fake Slurm in a scratch bin dir.
    fn fake_slurm(name: &str) -> (std::path::PathBuf, AgentConfig) {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!("profit-queue-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let scripts = [
            ("sbatch", "#!/bin/sh\ncat > \"$(dirname \"$0\")/submitted.sh\"\necho \"Submitted batch job 4242\"\n"),
            ("squeue", "#!/bin/sh\necho 4242_1\necho 4242_2\necho 17\n"),
            ("scontrol", "#!/bin/sh\necho \"$@\" > \"$(dirname \"$0\")/released\"\n"),
            ("scancel", "#!/bin/sh\necho \"$@\" > \"$(dirname \"$0\")/cancelled\"\nexit 1\n"),
        ];
        for (program, body) in scripts {
            let path = dir.join(program);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let config = AgentConfig {
            queue_bin_dir: dir.clone(),
            ..AgentConfig::default()
        };
        (dir, config)
    }

    async fn next_reply(rx: &mut mpsc::UnboundedReceiver<Frame>) -> QueueResponse {
        match rx.recv().await.expect("outbox closed") {
            Frame::Data(bytes) => match decode::<QueueResponse>(&String::from_utf8(bytes).unwrap()) {
                Ok(Inbound::Message(msg)) => msg,
                other => panic!("unexpected frame {other:?}"),
            },
            Frame::Close => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn unknown_backend_is_refused() {
        let err = QueueAgent::start("q".into(), Some("lsf"), None, &AgentConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, codes::QUEUE_COMMAND);
    }

    #[tokio::test]
    async fn submit_poll_release_and_failed_delete() {
        let (dir, config) = fake_slurm("cycle");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let out = Outbox { tx };
        let mut agent = QueueAgent::start("q".into(), Some("slurm"), None, &config)
            .await
            .unwrap();
        assert!(matches!(agent.ready(), StartReply::Ready { backend: Some(ref b), .. } if b == "slurm"));

        agent
            .handle(
                QueueRequest::Qsub {
                    transaction_id: "t1".into(),
                    jobs: vec!["/r/a/job_files".into(), "/r/b/job_files".into()],
                    header_lines: vec![],
                },
                &out,
            )
            .await;
        match next_reply(&mut rx).await {
            QueueResponse::Qsub { job_id, .. } => assert_eq!(job_id, "4242"),
            other => panic!("unexpected {other:?}"),
        }
        let script = std::fs::read_to_string(dir.join("submitted.sh")).unwrap();
        assert!(script.contains("--array=1-2"));

        agent.handle(QueueRequest::Qselect { transaction_id: Some("t2".into()) }, &out).await;
        match next_reply(&mut rx).await {
            QueueResponse::Qselect { transaction_id, job_ids, .. } => {
                assert_eq!(transaction_id.as_deref(), Some("t2"));
                assert_eq!(job_ids, vec!["17", "4242"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        agent
            .handle(
                QueueRequest::Qrls {
                    transaction_id: "t3".into(),
                    job_id: "4242".into(),
                },
                &out,
            )
            .await;
        assert!(matches!(next_reply(&mut rx).await, QueueResponse::Qrls { .. }));
        let released = std::fs::read_to_string(dir.join("released")).unwrap();
        assert_eq!(released.trim(), "release 4242");

        agent
            .handle(
                QueueRequest::Qdel {
                    transaction_id: "t4".into(),
                    job_ids: vec!["4242".into()],
                    force: true,
                },
                &out,
            )
            .await;
        match next_reply(&mut rx).await {
            QueueResponse::Error { transaction_id, error_code, .. } => {
                assert_eq!(transaction_id.as_deref(), Some("t4"));
                assert!(error_code.is(codes::QUEUE_COMMAND));
            }
            other => panic!("unexpected {other:?}"),
        }
        let cancelled = std::fs::read_to_string(dir.join("cancelled")).unwrap();
        assert_eq!(cancelled.trim(), "--signal=KILL 4242");

        agent.shutdown(&out).await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn poller_broadcasts_unsolicited_snapshots() {
        let (dir, config) = fake_slurm("poller");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let out = Outbox { tx };
        let mut agent = QueueAgent::start("q".into(), Some("slurm"), Some(1), &config)
            .await
            .unwrap();
        agent.started(&out);
        match next_reply(&mut rx).await {
            QueueResponse::Qselect { transaction_id, job_ids, .. } => {
                assert!(transaction_id.is_none());
                assert_eq!(job_ids.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        agent.shutdown(&out).await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
