//! Recorded effects: time, UUIDs, randomness, and HTTP.
//!
//! A step never touches the wall clock, the RNG, or the network directly.
//! It asks the recorder, which assigns a deterministic effect id
//! (`"<step_id>:<kind>:<counter>"`), returns the recorded value when the id
//! was seen before, and otherwise computes the value live and appends the
//! recording event. A replay that runs past the end of its recordings is in
//! new territory and simply starts recording again.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::EventType;
use crate::payload::{
    HttpRecorded, HttpRequestRecord, HttpResponseRecord, RandomRecorded, TimerFired, UuidRecorded,
};
use crate::replay::{RecordedHttp, ReplayContext};
use crate::writer::EventWriter;

/// The four recordable effect kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Now,
    Uuid,
    Random,
    Http,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::Now => "now",
            EffectKind::Uuid => "uuid",
            EffectKind::Random => "random",
            EffectKind::Http => "http",
        }
    }
}

/// Outbound HTTP at the seam: the engine records exchanges, the application
/// supplies the transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: &HttpRequestRecord)
        -> anyhow::Result<HttpResponseRecord>;
}

/// The recorded-effect maps a step replays against, cloned out of the
/// [`ReplayContext`] when a run starts.
#[derive(Debug, Clone, Default)]
pub struct RecordedEffects {
    pub time: BTreeMap<String, DateTime<Utc>>,
    pub uuid: BTreeMap<String, Uuid>,
    pub random: BTreeMap<String, u64>,
    pub http: BTreeMap<String, RecordedHttp>,
}

impl RecordedEffects {
    pub fn from_context(ctx: &ReplayContext) -> Self {
        Self {
            time: ctx.recorded_time.clone(),
            uuid: ctx.recorded_uuid.clone(),
            random: ctx.recorded_random.clone(),
            http: ctx.recorded_http.clone(),
        }
    }
}

/// Per-step effect recorder. Counters are monotonic per `(step, kind)`, so
/// the Nth call of a kind in a step always maps to the same effect id on
/// every replay.
pub struct EffectRecorder<'a> {
    step_id: String,
    counters: HashMap<EffectKind, u32>,
    recorded: &'a RecordedEffects,
    writer: &'a EventWriter,
    http_client: Option<&'a dyn HttpClient>,
}

impl<'a> EffectRecorder<'a> {
    pub fn new(
        step_id: impl Into<String>,
        recorded: &'a RecordedEffects,
        writer: &'a EventWriter,
        http_client: Option<&'a dyn HttpClient>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            counters: HashMap::new(),
            recorded,
            writer,
            http_client,
        }
    }

    fn next_effect_id(&mut self, kind: EffectKind) -> String {
        let counter = self.counters.entry(kind).or_insert(0);
        let id = format!("{}:{}:{}", self.step_id, kind.as_str(), counter);
        *counter += 1;
        id
    }

    /// Recorded wall-clock time.
    pub async fn now(&mut self) -> Result<DateTime<Utc>, StoreError> {
        let effect_id = self.next_effect_id(EffectKind::Now);
        if let Some(recorded) = self.recorded.time.get(&effect_id) {
            return Ok(*recorded);
        }
        let now = Utc::now();
        self.writer
            .append(EventType::TimerFired, &TimerFired { effect_id, now })
            .await?;
        Ok(now)
    }

    /// Recorded UUID mint.
    pub async fn new_uuid(&mut self) -> Result<Uuid, StoreError> {
        let effect_id = self.next_effect_id(EffectKind::Uuid);
        if let Some(recorded) = self.recorded.uuid.get(&effect_id) {
            return Ok(*recorded);
        }
        let value = Uuid::new_v4();
        self.writer
            .append(EventType::UuidRecorded, &UuidRecorded { effect_id, value })
            .await?;
        Ok(value)
    }

    /// Recorded random draw.
    pub async fn random_u64(&mut self) -> Result<u64, StoreError> {
        let effect_id = self.next_effect_id(EffectKind::Random);
        if let Some(recorded) = self.recorded.random.get(&effect_id) {
            return Ok(*recorded);
        }
        let value = fastrand::u64(..);
        self.writer
            .append(
                EventType::RandomRecorded,
                &RandomRecorded { effect_id, value },
            )
            .await?;
        Ok(value)
    }

    /// Recorded HTTP exchange. Fails when no transport is wired, which is
    /// the contract: HTTP only runs inside a recorded-effects context.
    pub async fn http(
        &mut self,
        request: HttpRequestRecord,
    ) -> Result<HttpResponseRecord, StoreError> {
        let effect_id = self.next_effect_id(EffectKind::Http);
        if let Some(recorded) = self.recorded.http.get(&effect_id) {
            return Ok(recorded.response.clone());
        }
        let client = self.http_client.ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!(
                "http effect requested but no http client is configured"
            ))
        })?;
        let response = client.execute(&request).await.map_err(StoreError::Backend)?;
        self.writer
            .append(
                EventType::HttpRecorded,
                &HttpRecorded {
                    effect_id,
                    request,
                    response: response.clone(),
                },
            )
            .await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AppendContext;
    use crate::memory::MemoryBackend;
    use crate::store::EventStore;
    use std::sync::Arc;

    async fn writer_for(backend: &Arc<MemoryBackend>) -> (Uuid, EventWriter) {
        let job_id = Uuid::new_v4();
        let writer = EventWriter::new(
            backend.clone() as Arc<dyn EventStore>,
            job_id,
            AppendContext::default(),
            0,
        );
        (job_id, writer)
    }

    #[tokio::test]
    async fn effect_ids_count_per_kind_within_a_step() {
        let backend = Arc::new(MemoryBackend::new());
        let (_, writer) = writer_for(&backend).await;
        let recorded = RecordedEffects::default();
        let mut recorder = EffectRecorder::new("n1", &recorded, &writer, None);
        recorder.now().await.unwrap();
        recorder.now().await.unwrap();
        recorder.new_uuid().await.unwrap();

        let (events, _) = backend.list_events(writer.job_id()).await.unwrap();
        let ids: Vec<String> = events
            .iter()
            .map(|e| e.payload["effect_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["n1:now:0", "n1:now:1", "n1:uuid:0"]);
    }

    #[tokio::test]
    async fn recorded_values_are_injected_without_new_events() {
        let backend = Arc::new(MemoryBackend::new());
        let (_, writer) = writer_for(&backend).await;
        let fixed = Uuid::new_v4();
        let mut recorded = RecordedEffects::default();
        recorded.uuid.insert("n1:uuid:0".to_string(), fixed);
        recorded.random.insert("n1:random:0".to_string(), 99);

        let mut recorder = EffectRecorder::new("n1", &recorded, &writer, None);
        assert_eq!(recorder.new_uuid().await.unwrap(), fixed);
        assert_eq!(recorder.random_u64().await.unwrap(), 99);

        let (events, version) = backend.list_events(writer.job_id()).await.unwrap();
        assert!(events.is_empty());
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn replay_past_recordings_enters_new_territory() {
        let backend = Arc::new(MemoryBackend::new());
        let (_, writer) = writer_for(&backend).await;
        let mut recorded = RecordedEffects::default();
        recorded.random.insert("n1:random:0".to_string(), 7);

        let mut recorder = EffectRecorder::new("n1", &recorded, &writer, None);
        assert_eq!(recorder.random_u64().await.unwrap(), 7);
        // Second draw has no recording: it executes live and is recorded.
        recorder.random_u64().await.unwrap();

        let (events, _) = backend.list_events(writer.job_id()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["effect_id"], "n1:random:1");
    }

    #[tokio::test]
    async fn http_without_transport_is_an_error() {
        let backend = Arc::new(MemoryBackend::new());
        let (_, writer) = writer_for(&backend).await;
        let recorded = RecordedEffects::default();
        let mut recorder = EffectRecorder::new("n1", &recorded, &writer, None);
        let request = HttpRequestRecord {
            method: "GET".into(),
            url: "https://api.test/x".into(),
            headers: Default::default(),
            body: None,
        };
        assert!(recorder.http(request).await.is_err());
    }

    #[tokio::test]
    async fn recorded_http_is_served_without_transport() {
        let backend = Arc::new(MemoryBackend::new());
        let (_, writer) = writer_for(&backend).await;
        let request = HttpRequestRecord {
            method: "GET".into(),
            url: "https://api.test/x".into(),
            headers: Default::default(),
            body: None,
        };
        let mut recorded = RecordedEffects::default();
        recorded.http.insert(
            "n1:http:0".to_string(),
            RecordedHttp {
                request: request.clone(),
                response: HttpResponseRecord {
                    status: 200,
                    headers: Default::default(),
                    body: "{\"ok\":true}".into(),
                },
            },
        );
        let mut recorder = EffectRecorder::new("n1", &recorded, &writer, None);
        let response = recorder.http(request).await.unwrap();
        assert_eq!(response.status, 200);
    }
}
