//! Live heart-rate streaming and background monitor settings.
//!
//! Streaming puts the band into continuous measurement mode and reads the
//! standard Heart Rate Measurement characteristic.  The band drops out of
//! continuous mode about 15 s after the last keep-alive ping, so a ping is
//! written every [`SessionConfig::keepalive_interval`](crate::types::SessionConfig).

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Local;
use futures::Stream;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::codec::decode_heart_rate;
use crate::error::{BandError, Result, TransportError};
use crate::protocol::{
    background_interval_command, background_monitor_command, HR_CMD_PING,
    HR_CMD_START_CONTINUOUS, HR_CMD_STOP_CONTINUOUS, HR_CMD_STOP_MANUAL,
};
use crate::session::{OperationGuard, Session, Shared};
use crate::transport::Transport;
use crate::types::{HeartBeatSample, SessionState};

/// A running heart-rate stream.
///
/// Yields samples until [`stop`](Self::stop) is called, the stream is
/// dropped, or an error ends it.  An error is delivered as the final item.
/// Both `stop` and drop write the stop command and disable notifications
/// before the session accepts another operation.
pub struct HeartRateStream {
    samples: mpsc::Receiver<Result<HeartBeatSample>>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl HeartRateStream {
    /// Next sample, or `None` once the stream has ended.
    pub async fn next_sample(&mut self) -> Option<Result<HeartBeatSample>> {
        self.samples.recv().await
    }

    /// Stop streaming and wait for the band to be switched back.
    ///
    /// Returns the result of the cleanup, or the error that had already
    /// ended the stream.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        // Unblocks a task still waiting to hand over its final error.
        self.samples.close();
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(BandError::Cancelled),
                Err(e) => Err(TransportError::Backend(format!("stream task failed: {e}")).into()),
            },
            None => Ok(()),
        }
    }

    /// `true` once the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Stream for HeartRateStream {
    type Item = Result<HeartBeatSample>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.samples.poll_recv(cx)
    }
}

impl<T: Transport> Session<T> {
    /// Put the band into continuous heart-rate mode and stream its readings.
    ///
    /// The session stays `Streaming` until the returned stream is stopped or
    /// dropped and its cleanup has finished.
    pub async fn start_heart_rate_stream(&self) -> Result<HeartRateStream> {
        let guard = self.begin_operation(Some(SessionState::Streaming))?;
        let services = self.services()?;
        let control = services.heart_rate_control;
        let measurement = services.heart_rate_measurement;
        let shared = &self.shared;

        let setup = async {
            shared.write(control, &HR_CMD_STOP_CONTINUOUS).await?;
            shared.write(control, &HR_CMD_STOP_MANUAL).await?;
            shared.set_notifications(measurement, true).await?;
            shared.clear_queue(measurement);
            shared.write(control, &HR_CMD_START_CONTINUOUS).await
        };
        if let Err(e) = setup.await {
            warn!("heart-rate start failed: {e}");
            if !e.is_connection_lost() && self.state() != SessionState::Disconnected {
                if let Err(c) = stop_streaming(shared, control, measurement).await {
                    debug!("cleanup after failed start: {c}");
                }
            }
            return Err(e);
        }
        info!("heart-rate streaming started");

        let (tx, samples) = mpsc::channel(shared.config.stream_buffer);
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_stream(
            Arc::clone(&self.shared),
            control,
            measurement,
            stop_rx,
            tx,
            guard,
        ));

        Ok(HeartRateStream {
            samples,
            stop: Some(stop),
            task: Some(task),
        })
    }

    /// Enable or disable the band's own periodic heart-rate measurement.
    pub async fn configure_background_monitor(
        &self,
        enabled: bool,
        interval_minutes: u8,
    ) -> Result<()> {
        let _guard = self.begin_operation(None)?;
        let control = self.services()?.heart_rate_control;
        info!(
            "background heart-rate monitor {} (every {interval_minutes} min)",
            if enabled { "on" } else { "off" }
        );
        self.shared
            .write(control, &background_monitor_command(enabled))
            .await?;
        self.shared
            .write(control, &background_interval_command(interval_minutes))
            .await
    }
}

async fn run_stream<T: Transport>(
    shared: Arc<Shared<T>>,
    control: Uuid,
    measurement: Uuid,
    mut stop: oneshot::Receiver<()>,
    tx: mpsc::Sender<Result<HeartBeatSample>>,
    _guard: OperationGuard,
) -> Result<()> {
    let period = shared.config.keepalive_interval;
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome: Result<()> = loop {
        tokio::select! {
            biased;
            _ = &mut stop => break Ok(()),
            _ = keepalive.tick() => {
                debug!("heart-rate keep-alive");
                if let Err(e) = shared.write(control, &HR_CMD_PING).await {
                    break Err(e);
                }
            }
            data = shared.next_notification(measurement) => {
                let bpm = match data.and_then(|d| decode_heart_rate(&d)) {
                    Ok(bpm) => bpm,
                    Err(e) => break Err(e),
                };
                debug!("heart rate {bpm}");
                let sample = HeartBeatSample {
                    time: Local::now().naive_local(),
                    bpm,
                };
                tokio::select! {
                    biased;
                    _ = &mut stop => break Ok(()),
                    sent = tx.send(Ok(sample)) => {
                        if sent.is_err() {
                            break Ok(());
                        }
                    }
                }
            }
        }
    };
    drop(keepalive);

    match outcome {
        Ok(()) => {
            let cleanup = stop_streaming(&shared, control, measurement).await;
            match &cleanup {
                Ok(()) => info!("heart-rate streaming stopped"),
                Err(e) => warn!("heart-rate stop failed: {e}"),
            }
            cleanup
        }
        Err(e) => {
            warn!("heart-rate stream ended: {e}");
            if !e.is_connection_lost() && shared.state() != SessionState::Disconnected {
                if let Err(c) = stop_streaming(&shared, control, measurement).await {
                    debug!("cleanup after stream error failed: {c}");
                }
            }
            // Fails only once the consumer has gone away.
            let _ = tx.send(Err(e.clone())).await;
            Err(e)
        }
    }
}

async fn stop_streaming<T: Transport>(
    shared: &Shared<T>,
    control: Uuid,
    measurement: Uuid,
) -> Result<()> {
    let stopped = shared.write(control, &HR_CMD_STOP_CONTINUOUS).await;
    let disabled = shared.set_notifications(measurement, false).await;
    stopped.and(disabled)
}
