use super::credentials::CredentialManager;
use crate::error::CommandError;
use crate::host::{DataSink, Notifier};
use crate::models::{Command, Verb};
use log::{debug, warn};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;

/// Buffer for one command type: at most one request in flight, at most one
/// result waiting to be drained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSlot {
    pub processing: bool,
    pub data_ready: bool,
    pub payload: Vec<u8>,
    pub errors: Vec<String>,
}

type Slots = Arc<Mutex<HashMap<Command, CommandSlot>>>;

/// Query string and body derived from a command's JSON arguments.
#[derive(Debug, Default, PartialEq)]
pub struct PreparedRequest {
    pub query: Vec<(String, String)>,
    pub body: Map<String, Value>,
}

/// Issues player commands without ever waiting on the network: callers poll
/// `execute` and pick up the result once the host has been signalled.
pub struct CommandDispatcher {
    credentials: CredentialManager,
    http: Client,
    api_base: String,
    notifier: Arc<dyn Notifier>,
    slots: Slots,
}

impl CommandDispatcher {
    pub fn new(credentials: CredentialManager, notifier: Arc<dyn Notifier>, api_base: &str) -> Self {
        Self {
            credentials,
            http: Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            notifier,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns `false` when the command could not be accepted (not
    /// authenticated, bad arguments); `true` when it was dispatched, is still
    /// in flight, or its buffered result was just written to `sink`.
    pub async fn execute(&self, command: Command, sink: &mut dyn DataSink, args: &str) -> bool {
        if !self.credentials.ensure_authenticated().await {
            warn!("{}: {}", command, CommandError::Unauthenticated);
            return false;
        }

        {
            let mut slots = lock_slots(&self.slots);
            let slot = slots.entry(command).or_default();
            if slot.data_ready {
                drain(slot, sink);
                return true;
            }
            if slot.processing {
                return true;
            }
            slot.processing = true;
        }

        let prepared = prepare_request(command, args).and_then(|p| {
            let url = command_url(&self.api_base, command, &p.query)
                .map_err(|e| CommandError::Transport(e.to_string()))?;
            Ok((url, p.body))
        });
        let (url, body) = match prepared {
            Ok(r) => r,
            Err(e) => {
                // nothing will complete this slot, so free it before reporting
                self.release(command);
                warn!("{} not sent: {}", command, e);
                sink.append_error(&e.to_string());
                return false;
            }
        };
        let Some(bearer) = self.credentials.bearer() else {
            self.release(command);
            warn!("{}: {}", command, CommandError::Unauthenticated);
            return false;
        };

        let verb = command.descriptor().verb;
        debug!("dispatching {} {:?} {}", command, verb, url);
        let http = self.http.clone();
        let slots = self.slots.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let outcome = send(&http, verb, url, &bearer, &body).await;
            complete(&slots, command, outcome);
            notifier.signal_data_ready(command.source());
        });
        true
    }

    /// Copy of the slot's current state (default if never used).
    pub fn slot(&self, command: Command) -> CommandSlot {
        lock_slots(&self.slots).get(&command).cloned().unwrap_or_default()
    }

    fn release(&self, command: Command) {
        if let Some(slot) = lock_slots(&self.slots).get_mut(&command) {
            slot.processing = false;
        }
    }
}

fn lock_slots(
    slots: &Mutex<HashMap<Command, CommandSlot>>,
) -> MutexGuard<'_, HashMap<Command, CommandSlot>> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

fn drain(slot: &mut CommandSlot, sink: &mut dyn DataSink) {
    if slot.payload.is_empty() {
        sink.set_null();
    } else {
        sink.set_json(&slot.payload);
    }
    for e in &slot.errors {
        sink.append_error(e);
    }
    *slot = CommandSlot::default();
}

fn complete(
    slots: &Mutex<HashMap<Command, CommandSlot>>,
    command: Command,
    outcome: Result<(u16, Vec<u8>), reqwest::Error>,
) {
    let verb = command.descriptor().verb;
    let mut slots = lock_slots(slots);
    let slot = slots.entry(command).or_default();
    slot.data_ready = true;
    slot.processing = false;
    match outcome {
        Err(e) => {
            warn!("{} request failed: {}", command, e);
            slot.errors.push(CommandError::Transport(e.to_string()).to_string());
        }
        Ok((204, _)) => {}
        Ok((_, body)) if verb == Verb::Get => slot.payload = body,
        // mutating endpoints answer 204 on success
        Ok((status, _)) => {
            debug!("{} answered {}", command, status);
            slot.errors.push(CommandError::Application(status).to_string());
        }
    }
}

async fn send(
    http: &Client,
    verb: Verb,
    url: Url,
    bearer: &str,
    body: &Map<String, Value>,
) -> Result<(u16, Vec<u8>), reqwest::Error> {
    let req = match verb {
        Verb::Get => http.get(url),
        Verb::Put => http.put(url),
        Verb::Post => http.post(url),
    }
    .header(AUTHORIZATION, bearer);
    let req = if !body.is_empty() {
        req.json(body)
    } else if verb != Verb::Get {
        // the API rejects body-less PUT/POST without an explicit length
        req.header(CONTENT_LENGTH, "0")
    } else {
        req
    };
    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;
    Ok((status, bytes.to_vec()))
}

/// Split `args` into query parameters and body fields for `command`.
///
/// `device_id` and the command's query keys go to the query string; for GET
/// commands every other field does too, otherwise the rest becomes the body.
pub fn prepare_request(command: Command, args: &str) -> Result<PreparedRequest, CommandError> {
    let desc = command.descriptor();
    let mut fields = parse_args(args);
    let mut query = Vec::new();

    move_to_query(&mut fields, &mut query, "device_id");
    if let Some(key) = desc.required {
        require_arg(&fields, key)?;
    }
    for key in desc.query_keys {
        move_to_query(&mut fields, &mut query, key);
    }
    if desc.verb == Verb::Get {
        for (k, v) in std::mem::take(&mut fields) {
            query.push((k, query_value(&v)));
        }
    }
    Ok(PreparedRequest { query, body: fields })
}

pub fn command_url(
    api_base: &str,
    command: Command,
    query: &[(String, String)],
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!(
        "{}/me/player{}",
        api_base.trim_end_matches('/'),
        command.descriptor().endpoint
    ))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

fn parse_args(args: &str) -> Map<String, Value> {
    if args.trim().is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(args) {
        Ok(Value::Object(m)) => m,
        Ok(other) => {
            debug!("ignoring non-object arguments: {}", other);
            Map::new()
        }
        Err(e) => {
            debug!("ignoring unparsable arguments: {}", e);
            Map::new()
        }
    }
}

fn require_arg(fields: &Map<String, Value>, key: &'static str) -> Result<(), CommandError> {
    if fields.contains_key(key) {
        Ok(())
    } else {
        Err(CommandError::MissingArgument(key))
    }
}

fn move_to_query(fields: &mut Map<String, Value>, query: &mut Vec<(String, String)>, key: &str) {
    if let Some(v) = fields.remove(key) {
        query.push((key.to_string(), query_value(&v)));
    }
}

fn query_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
