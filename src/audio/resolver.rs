//! Two-stage stream resolution.
//!
//! Stage 1 asks the extractor for an Opus stream that can be played without
//! re-encoding. If the probe does not confirm it, stage 1 is killed and
//! reaped, and stage 2 pipes a raw extraction through the transcoder.

use bytes::Bytes;
use std::{process::Stdio, sync::Arc, time::Duration};
use tokio::process::ChildStdout;
use tracing::{debug, info, warn};

use super::probe::{probe, ProbedHead, StreamCodec};
use crate::{
    error::{ProbeError, ResolutionError},
    process::{AttemptGuard, AttemptId, CommandTemplate, ProcessExit, ProcessSupervisor},
};

/// Plantillas de las tres invocaciones usadas al resolver audio.
#[derive(Debug, Clone)]
pub struct StreamCommands {
    /// Opus pre-codificado a 48 kHz, sin transcodificar
    pub fast_path: CommandTemplate,
    /// Cualquier códec, salida cruda a stdout
    pub extract: CommandTemplate,
    /// Lee de stdin y escribe Ogg/Opus a stdout
    pub transcode: CommandTemplate,
}

/// Etapa que produjo el stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Direct,
    Transcoded,
}

/// Stream listo para reproducir. Mientras viva, el intento sigue abierto y
/// sus procesos siguen corriendo.
#[derive(Debug)]
pub struct ResolvedStream {
    codec: StreamCodec,
    stage: Stage,
    head: Bytes,
    stdout: ChildStdout,
    attempt: AttemptGuard,
}

impl ResolvedStream {
    pub fn codec(&self) -> StreamCodec {
        self.codec
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn attempt_id(&self) -> AttemptId {
        self.attempt.id()
    }

    /// Bytes ya sondeados, el resto del stdout y el guard del intento.
    pub fn into_parts(self) -> (Bytes, ChildStdout, AttemptGuard) {
        (self.head, self.stdout, self.attempt)
    }
}

enum FastPathFailure {
    Spawn(ResolutionError),
    Probe(ProbeError),
}

pub struct StreamResolver {
    supervisor: Arc<ProcessSupervisor>,
    commands: StreamCommands,
    probe_timeout: Duration,
}

impl StreamResolver {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        commands: StreamCommands,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            commands,
            probe_timeout,
        }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Produce un stream reproducible para `reference` bajo `attempt`.
    ///
    /// Cuando retorna, solo quedan vivos los procesos de la etapa elegida.
    /// Si falla, el guard se suelta y no queda ningún proceso.
    pub async fn resolve(
        &self,
        reference: &str,
        attempt: AttemptGuard,
    ) -> Result<ResolvedStream, ResolutionError> {
        let id = attempt.id();

        match self.fast_path(reference, id).await {
            Ok((probed, stdout)) => {
                info!("⚡ Stream directo ({:?}) para {}", probed.codec, reference);
                return Ok(ResolvedStream {
                    codec: probed.codec,
                    stage: Stage::Direct,
                    head: probed.head,
                    stdout,
                    attempt,
                });
            }
            Err(FastPathFailure::Spawn(ResolutionError::Superseded)) => {
                return Err(ResolutionError::Superseded)
            }
            Err(FastPathFailure::Spawn(e)) => {
                debug!("🔄 Etapa directa no disponible: {}", e);
            }
            Err(FastPathFailure::Probe(e)) => {
                debug!("🔄 Etapa directa descartada: {}", e);
            }
        }

        // la etapa 1 debe estar muerta antes de lanzar la 2
        let exits = self.supervisor.terminate_processes(id).await;
        debug!("🪦 Etapa directa terminada ({} procesos)", exits.len());

        match self.transcoded(reference, id).await {
            Ok((probed, stdout)) => {
                info!("🎛️ Stream transcodificado para {}", reference);
                Ok(ResolvedStream {
                    codec: probed.codec,
                    stage: Stage::Transcoded,
                    head: probed.head,
                    stdout,
                    attempt,
                })
            }
            Err(e) => {
                if e != ResolutionError::Superseded {
                    warn!("❌ No se pudo resolver {}: {}", reference, e);
                }
                Err(e)
            }
        }
    }

    async fn fast_path(
        &self,
        reference: &str,
        attempt: AttemptId,
    ) -> Result<(ProbedHead, ChildStdout), FastPathFailure> {
        let spec = self.commands.fast_path.render(reference);
        let mut handle = self
            .supervisor
            .spawn(attempt, &spec, Stdio::null())
            .map_err(FastPathFailure::Spawn)?;

        let mut stdout = handle.take_stdout().ok_or_else(|| {
            FastPathFailure::Spawn(ResolutionError::MalformedOutput(format!(
                "{} sin stdout",
                spec.label
            )))
        })?;

        let probed = self
            .probe_with_timeout(&mut stdout)
            .await
            .map_err(FastPathFailure::Probe)?;
        Ok((probed, stdout))
    }

    async fn transcoded(
        &self,
        reference: &str,
        attempt: AttemptId,
    ) -> Result<(ProbedHead, ChildStdout), ResolutionError> {
        let extract = self.commands.extract.render(reference);
        let mut extractor = self.supervisor.spawn(attempt, &extract, Stdio::null())?;

        let pipe: Stdio = extractor
            .take_stdout()
            .ok_or_else(|| ResolutionError::MalformedOutput(format!("{} sin stdout", extract.label)))?
            .try_into()
            .map_err(|e: std::io::Error| ResolutionError::ToolFailed {
                tool: extract.label.clone(),
                code: None,
                stderr: e.to_string(),
            })?;

        let transcode = self.commands.transcode.render(reference);
        let mut transcoder = self.supervisor.spawn(attempt, &transcode, pipe)?;
        let mut stdout = transcoder.take_stdout().ok_or_else(|| {
            ResolutionError::MalformedOutput(format!("{} sin stdout", transcode.label))
        })?;

        match self.probe_with_timeout(&mut stdout).await {
            Ok(probed) => Ok((probed, stdout)),
            Err(probe_error) => {
                drop(stdout);
                let exits = self.supervisor.terminate_processes(attempt).await;
                Err(stage_failure(&transcode.label, probe_error, &exits))
            }
        }
    }

    async fn probe_with_timeout(&self, stdout: &mut ChildStdout) -> Result<ProbedHead, ProbeError> {
        tokio::time::timeout(self.probe_timeout, probe(stdout))
            .await
            .unwrap_or(Err(ProbeError::TimedOut))
    }
}

/// Traduce el fallo del sondeo de la etapa 2 al error que ve el usuario.
fn stage_failure(transcoder: &str, probe_error: ProbeError, exits: &[ProcessExit]) -> ResolutionError {
    let stderr = exits
        .iter()
        .flat_map(|exit| exit.stderr.iter().map(move |line| format!("{}: {}", exit.label, line)))
        .collect::<Vec<_>>()
        .join("\n");

    if let Some(failed) = exits.iter().find(|exit| exit.failure_code().is_some()) {
        return ResolutionError::ToolFailed {
            tool: failed.label.clone(),
            code: failed.failure_code(),
            stderr,
        };
    }

    match probe_error {
        ProbeError::TimedOut => ResolutionError::Timeout {
            tool: transcoder.to_string(),
        },
        ProbeError::EndOfStream(0) if stderr.is_empty() => ResolutionError::EmptyOutput {
            tool: transcoder.to_string(),
        },
        ProbeError::EndOfStream(_) => ResolutionError::ToolFailed {
            tool: transcoder.to_string(),
            code: None,
            stderr,
        },
        other => ResolutionError::MalformedOutput(other.to_string()),
    }
}
