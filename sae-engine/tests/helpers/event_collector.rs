//! Timeout-guarded access to engine events

use super::TEST_TIMEOUT;
use sae_common::events::{BufferDescriptor, BufferExtraData, BufferFillType, EngineEvent};
use sae_engine::transport::EventReceiver;

/// Decomposed `bufferFilled` event
#[derive(Debug, Clone)]
pub struct FilledBuffer {
    pub descriptor: BufferDescriptor,
    pub fill_type: BufferFillType,
    pub extra_data: Option<BufferExtraData>,
    pub channel_data: Vec<f32>,
}

impl FilledBuffer {
    pub fn from_event(event: EngineEvent) -> Option<Self> {
        match event {
            EngineEvent::BufferFilled {
                descriptor,
                buffer_fill_type,
                extra_data,
                channel_data,
            } => Some(Self {
                descriptor,
                fill_type: buffer_fill_type,
                extra_data,
                channel_data,
            }),
            _ => None,
        }
    }

    pub fn peak(&self) -> f32 {
        self.channel_data.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}

pub struct EventCollector {
    receiver: EventReceiver,
}

impl EventCollector {
    pub fn new(receiver: EventReceiver) -> Self {
        Self { receiver }
    }

    /// Next event, failing the test if none arrives in time
    pub async fn next(&mut self) -> EngineEvent {
        tokio::time::timeout(TEST_TIMEOUT, self.receiver.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    pub async fn next_buffer(&mut self) -> FilledBuffer {
        let event = self.next().await;
        FilledBuffer::from_event(event.clone())
            .unwrap_or_else(|| panic!("Expected bufferFilled, got {:?}", event))
    }

    pub async fn expect_idle(&mut self) {
        match self.next().await {
            EngineEvent::Idle => {}
            other => panic!("Expected idle, got {:?}", other),
        }
    }

    pub async fn expect_error(&mut self) -> String {
        match self.next().await {
            EngineEvent::Error { message } => message,
            other => panic!("Expected error, got {:?}", other),
        }
    }

    /// Everything already queued, without waiting
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Queued buffers only, in delivery order
    pub fn drain_buffers(&mut self) -> Vec<FilledBuffer> {
        self.drain()
            .into_iter()
            .filter_map(FilledBuffer::from_event)
            .collect()
    }

    pub fn assert_empty(&mut self) {
        let events = self.drain();
        assert!(events.is_empty(), "Unexpected events: {:?}", events);
    }
}
