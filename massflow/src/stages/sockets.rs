//! Per-replica sockets: the stage function's view of the frame.
//!
//! Sockets hold one push socket per stage of the frame (the outbound table)
//! and the pull socket of the replica's own stage. Every send encodes the
//! payload, every receive decodes one.

use crate::codec;
use crate::errors::SocketError;
use crate::payload::{StageIdentity, StagePayload};
use crate::transport::PushSocket;
use crate::transport::PullSocket;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Push sockets to every stage of a frame, by stage name.
#[derive(Debug, Clone, Default)]
pub struct OutboundTable {
    routes: HashMap<String, PushSocket>,
}

impl OutboundTable {
    pub(crate) fn new(routes: HashMap<String, PushSocket>) -> Self {
        Self { routes }
    }

    /// Returns the push socket of `stage`.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<&PushSocket> {
        self.routes.get(stage)
    }

    /// Names of every reachable stage.
    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Number of reachable stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns true if no stage is reachable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug)]
struct SocketsCore {
    name: String,
    next_stage: Option<String>,
    outbound: Arc<OutboundTable>,
    inbound: PullSocket,
}

impl SocketsCore {
    fn route(&self, target: &str) -> Result<&PushSocket, SocketError> {
        self.outbound
            .get(target)
            .ok_or_else(|| SocketError::UnknownStage {
                from: self.name.clone(),
                target: target.to_string(),
            })
    }

    fn default_target(&self) -> Result<&str, SocketError> {
        self.next_stage
            .as_deref()
            .ok_or_else(|| SocketError::NoNextStage {
                stage: self.name.clone(),
            })
    }

    fn instructed_target(&self, payload: &StagePayload) -> Result<String, SocketError> {
        payload
            .stage_instruction()
            .map(str::to_string)
            .ok_or_else(|| SocketError::MissingInstruction {
                stage: self.name.clone(),
            })
    }

    fn attach_instruction(
        &self,
        payload: &mut StagePayload,
        stage: &str,
        report_name: &str,
        data: Map<String, Value>,
        instruction: Option<&str>,
    ) {
        let return_to = instruction
            .map(str::to_string)
            .or_else(|| self.next_stage.clone());
        payload
            .envelope_mut()
            .instruct(stage, report_name, data, return_to);
    }
}

/// Blocking sockets handed to process-mode stage functions.
#[derive(Debug)]
pub struct SyncSockets {
    core: SocketsCore,
}

impl SyncSockets {
    pub(crate) fn new(
        name: impl Into<String>,
        next_stage: Option<String>,
        outbound: Arc<OutboundTable>,
        inbound: PullSocket,
    ) -> Self {
        Self {
            core: SocketsCore {
                name: name.into(),
                next_stage,
                outbound,
                inbound,
            },
        }
    }

    /// Name of the stage these sockets belong to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The default next stage.
    #[must_use]
    pub fn next_stage(&self) -> Option<&str> {
        self.core.next_stage.as_deref()
    }

    /// Sends a payload to the default next stage.
    ///
    /// Blocks while the next stage's queue is full.
    pub fn send(&self, payload: StagePayload) -> Result<(), SocketError> {
        let target = self.core.default_target()?.to_string();
        self.send_to(payload, &target)
    }

    /// Sends a payload to the named stage.
    pub fn send_to(&self, payload: StagePayload, stage: &str) -> Result<(), SocketError> {
        let socket = self.core.route(stage)?;
        let message = codec::encode(&payload)?;
        socket.send_blocking(message)?;
        Ok(())
    }

    /// Sends a payload to `stage` together with instructions for it.
    ///
    /// `data` becomes the called stage's stage report, with `report_name`
    /// naming where the called stage stores its answer. The answer is routed
    /// to `instruction`, or to this stage's next stage when `None`.
    pub fn send_with_instruction(
        &self,
        mut payload: StagePayload,
        stage: &str,
        report_name: &str,
        data: Map<String, Value>,
        instruction: Option<&str>,
    ) -> Result<(), SocketError> {
        self.core.route(stage)?;
        self.core
            .attach_instruction(&mut payload, stage, report_name, data, instruction);
        self.send_to(payload, stage)
    }

    /// Sends a payload to the stage named by its stage instruction.
    pub fn send_instructed(&self, payload: StagePayload) -> Result<(), SocketError> {
        let target = self.core.instructed_target(&payload)?;
        self.send_to(payload, &target)
    }

    /// Waits for the next payload of this stage.
    pub fn receive(&self) -> Result<StagePayload, SocketError> {
        let message = self.core.inbound.receive_blocking()?;
        Ok(codec::decode(&message)?)
    }
}

impl StageIdentity for SyncSockets {
    fn stage_name(&self) -> &str {
        self.name()
    }
}

/// Async sockets handed to cooperative stage functions.
///
/// Cloning is cheap; clones share the same queues.
#[derive(Debug, Clone)]
pub struct AsyncSockets {
    core: Arc<SocketsCore>,
}

impl AsyncSockets {
    pub(crate) fn new(
        name: impl Into<String>,
        next_stage: Option<String>,
        outbound: Arc<OutboundTable>,
        inbound: PullSocket,
    ) -> Self {
        Self {
            core: Arc::new(SocketsCore {
                name: name.into(),
                next_stage,
                outbound,
                inbound,
            }),
        }
    }

    /// Name of the stage these sockets belong to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The default next stage.
    #[must_use]
    pub fn next_stage(&self) -> Option<&str> {
        self.core.next_stage.as_deref()
    }

    /// Sends a payload to the default next stage.
    ///
    /// Yields to other cooperative tasks first, then suspends while the next
    /// stage's queue is full.
    pub async fn send(&self, payload: StagePayload) -> Result<(), SocketError> {
        let target = self.core.default_target()?.to_string();
        self.send_to(payload, &target).await
    }

    /// Sends a payload to the named stage.
    pub async fn send_to(&self, payload: StagePayload, stage: &str) -> Result<(), SocketError> {
        tokio::task::yield_now().await;
        let socket = self.core.route(stage)?;
        let message = codec::encode(&payload)?;
        socket.send(message).await?;
        Ok(())
    }

    /// Sends a payload to `stage` together with instructions for it.
    ///
    /// See [`SyncSockets::send_with_instruction`].
    pub async fn send_with_instruction(
        &self,
        mut payload: StagePayload,
        stage: &str,
        report_name: &str,
        data: Map<String, Value>,
        instruction: Option<&str>,
    ) -> Result<(), SocketError> {
        self.core.route(stage)?;
        self.core
            .attach_instruction(&mut payload, stage, report_name, data, instruction);
        self.send_to(payload, stage).await
    }

    /// Sends a payload to the stage named by its stage instruction.
    pub async fn send_instructed(&self, payload: StagePayload) -> Result<(), SocketError> {
        let target = self.core.instructed_target(&payload)?;
        self.send_to(payload, &target).await
    }

    /// Waits for the next payload of this stage.
    pub async fn receive(&self) -> Result<StagePayload, SocketError> {
        let message = self.core.inbound.receive().await?;
        Ok(codec::decode(&message)?)
    }
}

impl StageIdentity for AsyncSockets {
    fn stage_name(&self) -> &str {
        self.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Wiring {
        outbound: Arc<OutboundTable>,
        inbound: HashMap<String, PullSocket>,
    }

    fn wiring(stages: &[&str]) -> Wiring {
        let mut routes = HashMap::new();
        let mut inbound = HashMap::new();
        for stage in stages {
            let (push, pull) = channel(8);
            routes.insert((*stage).to_string(), push);
            inbound.insert((*stage).to_string(), pull);
        }
        Wiring {
            outbound: Arc::new(OutboundTable::new(routes)),
            inbound,
        }
    }

    fn sync_sockets(w: &Wiring, name: &str, next: Option<&str>) -> SyncSockets {
        SyncSockets::new(
            name,
            next.map(str::to_string),
            w.outbound.clone(),
            w.inbound[name].clone(),
        )
    }

    fn tagged(tag: &str) -> StagePayload {
        let mut payload = StagePayload::generic();
        payload.envelope_mut().report_tags([tag]);
        payload
    }

    #[test]
    fn test_send_uses_next_stage() {
        let w = wiring(&["a", "b"]);
        let a = sync_sockets(&w, "a", Some("b"));
        let b = sync_sockets(&w, "b", None);

        a.send(tagged("x")).unwrap();
        assert_eq!(b.receive().unwrap().report().tags, vec!["x"]);
    }

    #[test]
    fn test_send_without_next_stage() {
        let w = wiring(&["a"]);
        let a = sync_sockets(&w, "a", None);
        assert!(matches!(
            a.send(tagged("x")),
            Err(SocketError::NoNextStage { stage }) if stage == "a"
        ));
    }

    #[test]
    fn test_send_to_unknown_stage() {
        let w = wiring(&["a"]);
        let a = sync_sockets(&w, "a", None);
        assert!(matches!(
            a.send_to(tagged("x"), "nowhere"),
            Err(SocketError::UnknownStage { target, .. }) if target == "nowhere"
        ));
    }

    #[test]
    fn test_send_instructed_routes_by_instruction() {
        let w = wiring(&["a", "b", "c"]);
        let a = sync_sockets(&w, "a", Some("b"));
        let c = sync_sockets(&w, "c", None);

        let mut payload = tagged("routed");
        payload.envelope_mut().stage_instruction = Some("c".to_string());
        a.send_instructed(payload).unwrap();

        assert_eq!(c.receive().unwrap().report().tags, vec!["routed"]);
        assert!(w.inbound["b"].try_receive().unwrap().is_none());
    }

    #[test]
    fn test_send_instructed_without_instruction() {
        let w = wiring(&["a"]);
        let a = sync_sockets(&w, "a", None);
        assert!(matches!(
            a.send_instructed(tagged("x")),
            Err(SocketError::MissingInstruction { .. })
        ));
    }

    #[test]
    fn test_request_response_fan_out() {
        let w = wiring(&["collect", "dns", "report"]);
        let collect = sync_sockets(&w, "collect", Some("report"));
        let dns = sync_sockets(&w, "dns", None);
        let report = sync_sockets(&w, "report", None);

        let data = match json!({"host": "example.org"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        collect
            .send_with_instruction(StagePayload::generic(), "dns", "addresses", data, None)
            .unwrap();

        let mut request = dns.receive().unwrap();
        assert_eq!(request.stage_instruction(), Some("report"));
        let host = request.envelope_mut().get_instruction(&dns, "host");
        assert_eq!(host, Some(json!("example.org")));
        request
            .envelope_mut()
            .make_instructed_stage_report(&dns, json!(["93.184.216.34"]));
        dns.send_instructed(request).unwrap();

        let answered = report.receive().unwrap();
        assert_eq!(
            answered.envelope().get_stage_report("addresses"),
            Some(&json!(["93.184.216.34"]))
        );
    }

    #[test]
    fn test_explicit_instruction_overrides_next_stage() {
        let w = wiring(&["a", "b", "c"]);
        let a = sync_sockets(&w, "a", Some("b"));
        let b = sync_sockets(&w, "b", None);

        a.send_with_instruction(tagged("x"), "b", "answer", Map::new(), Some("c"))
            .unwrap();
        assert_eq!(b.receive().unwrap().stage_instruction(), Some("c"));
    }

    #[test]
    fn test_receive_reports_closed_queue() {
        let (push, pull) = channel(1);
        let sockets = SyncSockets::new("a", None, Arc::new(OutboundTable::default()), pull);
        drop(push);

        let err = sockets.receive().unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_async_sockets_round_trip() {
        let w = wiring(&["a", "b"]);
        let a = AsyncSockets::new("a", Some("b".to_string()), w.outbound.clone(), w.inbound["a"].clone());
        let b = AsyncSockets::new("b", None, w.outbound.clone(), w.inbound["b"].clone());

        a.send(tagged("1")).await.unwrap();
        a.send(tagged("2")).await.unwrap();

        assert_eq!(b.receive().await.unwrap().report().tags, vec!["1"]);
        assert_eq!(b.clone().receive().await.unwrap().report().tags, vec!["2"]);
        assert_eq!(a.stage_name(), "a");
    }
}
