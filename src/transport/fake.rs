//! Scripted in-memory transport for session tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{EventSink, Transport, TransportEvent, TransportHandle, VoiceTarget};
use crate::error::TransportError;

#[derive(Default)]
struct FakeState {
    connect_failures: usize,
    stream_failures: HashMap<String, usize>,
    connects: Vec<VoiceTarget>,
    disconnects: usize,
    streams: Vec<(String, EventSink)>,
    gains: Vec<f32>,
    pauses: usize,
    resumes: usize,
    stops: usize,
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next `times` connects fail.
    pub(crate) fn fail_connects(&self, times: usize) {
        self.state.lock().connect_failures = times;
    }

    /// The next `times` streams of `url` fail synchronously.
    pub(crate) fn fail_streams(&self, url: &str, times: usize) {
        self.state.lock().stream_failures.insert(url.to_string(), times);
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.lock().connects.len()
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    /// Every URL handed to `stream`, failed attempts included.
    pub(crate) fn streamed(&self) -> Vec<String> {
        self.state.lock().streams.iter().map(|(url, _)| url.clone()).collect()
    }

    pub(crate) fn last_gain(&self) -> Option<f32> {
        self.state.lock().gains.last().copied()
    }

    pub(crate) fn pauses(&self) -> usize {
        self.state.lock().pauses
    }

    pub(crate) fn resumes(&self) -> usize {
        self.state.lock().resumes
    }

    pub(crate) fn stops(&self) -> usize {
        self.state.lock().stops
    }

    /// Emits `event` on the most recent stream.
    pub(crate) fn emit(&self, event: TransportEvent) -> bool {
        let sink = self.state.lock().streams.last().map(|(_, sink)| sink.clone());
        sink.is_some_and(|sink| sink.emit(event))
    }

    /// Emits `event` on the `index`-th stream ever started.
    pub(crate) fn emit_on(&self, index: usize, event: TransportEvent) -> bool {
        let sink = self.state.lock().streams.get(index).map(|(_, sink)| sink.clone());
        sink.is_some_and(|sink| sink.emit(event))
    }

    pub(crate) fn finish(&self) -> bool {
        self.emit(TransportEvent::Finished)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, target: VoiceTarget) -> Result<TransportHandle, TransportError> {
        let mut state = self.state.lock();
        state.connects.push(target);
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TransportError::Connect("voice gateway refused".into()));
        }
        Ok(TransportHandle::new(target))
    }

    async fn disconnect(&self, _handle: &TransportHandle) {
        self.state.lock().disconnects += 1;
    }

    async fn stream(
        &self,
        _handle: &TransportHandle,
        source_url: &str,
        gain: f32,
        sink: EventSink,
    ) -> Result<(), TransportError> {
        let failing = {
            let mut state = self.state.lock();
            state.streams.push((source_url.to_string(), sink.clone()));
            state.gains.push(gain);
            match state.stream_failures.get_mut(source_url) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        if failing {
            return Err(TransportError::StreamStart(format!("cannot open {}", source_url)));
        }

        sink.emit(TransportEvent::Started);
        Ok(())
    }

    async fn set_gain(&self, _handle: &TransportHandle, gain: f32) -> Result<(), TransportError> {
        self.state.lock().gains.push(gain);
        Ok(())
    }

    async fn pause(&self, _handle: &TransportHandle) -> Result<(), TransportError> {
        self.state.lock().pauses += 1;
        Ok(())
    }

    async fn resume(&self, _handle: &TransportHandle) -> Result<(), TransportError> {
        self.state.lock().resumes += 1;
        Ok(())
    }

    async fn stop_stream(&self, _handle: &TransportHandle) -> Result<(), TransportError> {
        self.state.lock().stops += 1;
        Ok(())
    }
}
