//! Maps device ids to open audio streams.
//!
//! Grounded in the original engine's stream manager: a `device_id -> stream`
//! table where creating a stream for an id that's already open replaces it,
//! and the manager's own mutex is only ever held for the map lookup itself -
//! never across a stream build/open/close.

use std::collections::HashMap;
use std::sync::Mutex;

use cpal::Device;
use crossbeam_channel::Sender;

use crate::config::StreamConfig;
use crate::error::CoreResult;
use crate::message::Event;
use crate::stream::AudioStream;

#[derive(Default)]
pub struct StreamManager {
    streams: Mutex<HashMap<String, AudioStream>>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self { streams: Mutex::new(HashMap::new()) }
    }

    pub fn create_input(
        &self,
        device_id: impl Into<String>,
        config: StreamConfig,
        device: &Device,
        signal_level: f32,
        event_sender: Sender<Event>,
    ) -> CoreResult<()> {
        let device_id = device_id.into();
        let stream = AudioStream::start_input(config, device, signal_level, event_sender)?;
        self.streams.lock().expect("stream map poisoned").insert(device_id, stream);
        Ok(())
    }

    pub fn create_output(
        &self,
        device_id: impl Into<String>,
        config: StreamConfig,
        device: &Device,
        event_sender: Sender<Event>,
    ) -> CoreResult<()> {
        let device_id = device_id.into();
        let stream = AudioStream::start_output(config, device, event_sender)?;
        self.streams.lock().expect("stream map poisoned").insert(device_id, stream);
        Ok(())
    }

    pub fn create_duplex(
        &self,
        device_id: impl Into<String>,
        config: StreamConfig,
        input_device: &Device,
        output_device: &Device,
        signal_level: f32,
        event_sender: Sender<Event>,
    ) -> CoreResult<()> {
        let device_id = device_id.into();
        let stream =
            AudioStream::start_duplex(config, input_device, output_device, signal_level, event_sender)?;
        self.streams.lock().expect("stream map poisoned").insert(device_id, stream);
        Ok(())
    }

    pub fn remove(&self, device_id: &str) {
        self.streams.lock().expect("stream map poisoned").remove(device_id);
    }

    /// Current scored CV level for an input/duplex stream, or 0.0 if the
    /// device has no open stream.
    pub fn input_level(&self, device_id: &str) -> f32 {
        self.streams
            .lock()
            .expect("stream map poisoned")
            .get(device_id)
            .map(|s| s.current_level())
            .unwrap_or(0.0)
    }

    pub fn has_stream(&self, device_id: &str) -> bool {
        self.streams.lock().expect("stream map poisoned").contains_key(device_id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("stream map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_manager_has_no_streams() {
        let manager = StreamManager::new();
        assert!(!manager.has_stream("missing"));
        assert_eq!(manager.input_level("missing"), 0.0);
        assert_eq!(manager.stream_count(), 0);
    }

    #[test]
    fn remove_on_unknown_id_is_a_no_op() {
        let manager = StreamManager::new();
        manager.remove("missing");
        assert_eq!(manager.stream_count(), 0);
    }
}
