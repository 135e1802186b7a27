//! Helper methods only available for tests
//!
//! Provides a small in-memory API server behind the tower-test mock channel.
//! It serves get/list/patch/delete generically from an object store and
//! records every write, so reconcile tests can assert convergence properties
//! instead of scripting individual request/response pairs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use hyper::{body::to_bytes, Body};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

use crate::cluster::{SearchCluster, SearchClusterSpec, SearchClusterStatus};
use crate::utils::test::ApiServerHandle;

// Add tests specific implementation to the SearchCluster
impl SearchCluster {
    /// A normal test cluster
    pub fn test() -> Self {
        let mut cluster = SearchCluster::new("test", SearchClusterSpec::default());
        cluster.metadata.namespace = Some("default".to_owned());
        cluster.metadata.uid = Some("uid-test".to_owned());
        cluster
    }
    /// Modify a cluster to have an expected spec
    pub fn with_spec(self, spec: SearchClusterSpec) -> Self {
        Self { spec, ..self }
    }
    /// Modify a cluster to have an expected status
    pub fn with_status(self, status: SearchClusterStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }
}

/// A single write performed against the stub API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Server side apply of a resource.
    Apply { kind: String, name: String },
    /// Deletion of a resource.
    Delete { kind: String, name: String },
    /// Patch of a status subresource.
    PatchStatus { kind: String, name: String },
}

/// Object store behind the stub API server.
///
/// Objects are keyed by (plural kind, namespace, name) and held as raw JSON
/// so the store stays agnostic of resource types.
#[derive(Debug, Default)]
pub struct ApiServerState {
    objects: BTreeMap<(String, String, String), Value>,
    /// Every write performed, in order.
    pub writes: Vec<WriteOp>,
}

impl ApiServerState {
    pub fn insert<T: Serialize>(&mut self, kind: &str, ns: &str, name: &str, object: &T) {
        let value = serde_json::to_value(object).expect("object should serialize");
        self.objects
            .insert((kind.to_owned(), ns.to_owned(), name.to_owned()), value);
    }

    pub fn get<T: DeserializeOwned>(&self, kind: &str, ns: &str, name: &str) -> Option<T> {
        self.objects
            .get(&(kind.to_owned(), ns.to_owned(), name.to_owned()))
            .map(|value| {
                serde_json::from_value(value.clone()).expect("object should deserialize")
            })
    }

    pub fn contains(&self, kind: &str, ns: &str, name: &str) -> bool {
        self.objects
            .contains_key(&(kind.to_owned(), ns.to_owned(), name.to_owned()))
    }

    /// Names of every stored object of a kind, sorted.
    pub fn names(&self, kind: &str, ns: &str) -> Vec<String> {
        self.objects
            .keys()
            .filter(|(k, n, _)| k == kind && n == ns)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Overwrite the status field of a stored object.
    pub fn set_status(&mut self, kind: &str, ns: &str, name: &str, status: Value) {
        let object = self
            .objects
            .get_mut(&(kind.to_owned(), ns.to_owned(), name.to_owned()))
            .expect("object should exist");
        object["status"] = status;
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }
}

/// Serves API requests from the mock channel against a shared state.
pub struct StubApiServer;

impl StubApiServer {
    /// Serve requests until the client side hangs up.
    pub fn run(
        state: Arc<Mutex<ApiServerState>>,
        mut handle: ApiServerHandle,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                let response = Self::handle(&state, request)
                    .await
                    .expect("request should be handled");
                send.send_response(response);
            }
        })
    }

    async fn handle(
        state: &Arc<Mutex<ApiServerState>>,
        request: http::Request<Body>,
    ) -> Result<http::Response<Body>> {
        let method = request.method().clone();
        let uri = request.uri().clone();
        let body_bytes = to_bytes(request.into_body()).await?;
        let Some(target) = Target::parse(uri.path()) else {
            return respond(404, not_found());
        };
        let key = |name: &str| (target.kind.clone(), target.ns.clone(), name.to_owned());

        match (method.as_str(), &target.name) {
            ("GET", Some(name)) => {
                let object = state.lock().unwrap().objects.get(&key(name)).cloned();
                match object {
                    Some(object) => respond(200, object),
                    None => respond(404, not_found()),
                }
            }
            ("GET", None) => {
                let selector = label_selector(uri.query().unwrap_or(""));
                let state = state.lock().unwrap();
                let items: Vec<Value> = state
                    .objects
                    .iter()
                    .filter(|((kind, ns, _), _)| kind == &target.kind && ns == &target.ns)
                    .map(|(_, object)| object.clone())
                    .filter(|object| match &selector {
                        Some(selector) => matches_selector(object, selector),
                        None => true,
                    })
                    .collect();
                respond(
                    200,
                    json!({
                        "apiVersion": "v1",
                        "kind": "List",
                        "metadata": { "resourceVersion": "" },
                        "items": items,
                    }),
                )
            }
            ("PATCH", Some(name)) if target.status => {
                let patch: Value = serde_json::from_slice(&body_bytes)?;
                let status = patch
                    .get("status")
                    .cloned()
                    .ok_or_else(|| anyhow!("status patch should carry a status"))?;
                let mut state = state.lock().unwrap();
                let object = state
                    .objects
                    .entry(key(name))
                    .or_insert_with(|| json!({"metadata": {"name": name}}));
                object["status"] = status;
                let object = object.clone();
                state.writes.push(WriteOp::PatchStatus {
                    kind: target.kind.clone(),
                    name: name.clone(),
                });
                respond(200, object)
            }
            ("PATCH", Some(name)) => {
                let mut object: Value = serde_json::from_slice(&body_bytes)?;
                object["metadata"]["name"] = json!(name);
                object["metadata"]["namespace"] = json!(target.ns);
                let mut state = state.lock().unwrap();
                state.objects.insert(key(name), object.clone());
                state.writes.push(WriteOp::Apply {
                    kind: target.kind.clone(),
                    name: name.clone(),
                });
                respond(200, object)
            }
            ("DELETE", Some(name)) => {
                let mut state = state.lock().unwrap();
                match state.objects.remove(&key(name)) {
                    Some(_) => {
                        state.writes.push(WriteOp::Delete {
                            kind: target.kind.clone(),
                            name: name.clone(),
                        });
                        respond(
                            200,
                            json!({
                                "apiVersion": "v1",
                                "kind": "Status",
                                "metadata": {},
                                "status": "Success",
                            }),
                        )
                    }
                    None => respond(404, not_found()),
                }
            }
            _ => respond(404, not_found()),
        }
    }
}

struct Target {
    kind: String,
    ns: String,
    name: Option<String>,
    status: bool,
}

impl Target {
    // Paths look like
    //   /api/v1/namespaces/{ns}/{plural}[/{name}[/status]]
    //   /apis/{group}/{version}/namespaces/{ns}/{plural}[/{name}[/status]]
    fn parse(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let rest = match segments.first()? {
            &"api" => segments.get(2..)?,
            &"apis" => segments.get(3..)?,
            _ => return None,
        };
        if rest.first() != Some(&"namespaces") {
            return None;
        }
        Some(Self {
            ns: rest.get(1)?.to_string(),
            kind: rest.get(2)?.to_string(),
            name: rest.get(3).map(|s| s.to_string()),
            status: rest.get(4) == Some(&"status"),
        })
    }
}

fn respond(code: u16, body: Value) -> Result<http::Response<Body>> {
    Ok(http::Response::builder()
        .status(code)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body)?))?)
}

fn not_found() -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Status",
        "metadata": {},
        "status": "Failure",
        "message": "not found",
        "reason": "NotFound",
        "code": 404,
    })
}

fn label_selector(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("labelSelector="))
        .map(percent_decode)
}

fn percent_decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut position = 0;
    while position < bytes.len() {
        match bytes[position] {
            b'%' if position + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[position + 1..position + 3]).ok();
                match hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        position += 3;
                    }
                    None => {
                        out.push(bytes[position]);
                        position += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                position += 1;
            }
            byte => {
                out.push(byte);
                position += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn matches_selector(object: &Value, selector: &str) -> bool {
    let labels = object
        .get("metadata")
        .and_then(|metadata| metadata.get("labels"));
    selector.split(',').all(|requirement| {
        let Some((label, expected)) = requirement.split_once('=') else {
            return true;
        };
        labels
            .and_then(|labels| labels.get(label))
            .and_then(Value::as_str)
            == Some(expected)
    })
}
