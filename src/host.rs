//! Host
//!
//! Dispatches protocol requests onto tables and views. The engine is loaded
//! lazily by `init`; every other command is rejected until it is ready.
//! Handler failures become error replies and never stop dispatch.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::{json, Value as JsonValue};

use crate::engine::{Engine, EngineResult};
use crate::error::{Error, Result};
use crate::messages::{Command, Reply, Request, TableMethod, TableStep, ViewMethod};
use crate::normalize::TableData;
use crate::settings::Settings;
use crate::table::Table;
use crate::value::RawValue;
use crate::view::{View, ViewportOptions};

/// Builds the engine from the optional `init` payload.
pub type EngineFactory = Box<dyn Fn(Option<&[u8]>) -> EngineResult<Rc<dyn Engine>>>;

/// Where replies for one client go.
pub type Sink = Rc<dyn Fn(Reply)>;

pub enum EngineState {
    Uninitialized,
    Loading,
    Ready(Rc<dyn Engine>),
}

impl EngineState {
    pub fn is_ready(&self) -> bool {
        matches!(self, EngineState::Ready(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Table(String),
    View(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    TableDelete,
    ViewUpdate,
    ViewDelete,
}

/// A persistent callback installed by a `subscribe: true` request.
#[derive(Debug, Clone)]
struct Subscription {
    request: u64,
    client_id: String,
    target: Target,
    hook: Hook,
    callback: u64,
}

pub struct Host {
    state: EngineState,
    factory: EngineFactory,
    settings: Settings,
    tables: IndexMap<String, Table>,
    views: IndexMap<String, View>,
    view_owners: HashMap<String, String>,
    subscriptions: Vec<Subscription>,
}

impl Host {
    pub fn new(settings: Settings, factory: EngineFactory) -> Self {
        Host {
            state: EngineState::Uninitialized,
            factory,
            settings,
            tables: IndexMap::new(),
            views: IndexMap::new(),
            view_owners: HashMap::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn view(&self, name: &str) -> Option<&View> {
        self.views.get(name)
    }

    pub fn num_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Parses and processes one text frame.
    pub fn handle_raw(&mut self, client_id: &str, text: &str, sink: &Sink) {
        let value: JsonValue = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                sink(Reply::error(None, &Error::protocol(format!("invalid JSON: {}", e))));
                return;
            }
        };
        let id = value.get("id").and_then(JsonValue::as_u64);
        match serde_json::from_value::<Request>(value) {
            Ok(request) => self.process(client_id, request, sink),
            Err(e) => {
                log::warn!("Rejected message from {}: {}", client_id, e);
                sink(Reply::error(id, &Error::protocol(e.to_string())));
            }
        }
    }

    pub fn process(&mut self, client_id: &str, request: Request, sink: &Sink) {
        let id = request.id;
        let result = match request.command {
            Command::Init { payload } => self.init(payload.as_deref()).map(Some),
            _ if !self.state.is_ready() => Err(Error::NotReady),
            command => self.dispatch(client_id, id, command, sink),
        };
        match result {
            Ok(Some(data)) => sink(Reply::data(id, data)),
            Ok(None) => {}
            Err(e) => {
                log::debug!("Request {} from {} failed: {}", id, client_id, e);
                sink(Reply::error(Some(id), &e));
            }
        }
    }

    fn init(&mut self, payload: Option<&[u8]>) -> Result<JsonValue> {
        if self.state.is_ready() {
            log::debug!("Engine already initialized");
            return Ok(JsonValue::Null);
        }
        self.state = EngineState::Loading;
        match (self.factory)(payload) {
            Ok(engine) => {
                self.state = EngineState::Ready(engine);
                log::info!("Engine ready");
                Ok(JsonValue::Null)
            }
            Err(e) => {
                self.state = EngineState::Uninitialized;
                log::error!("Engine failed to load: {}", e);
                Err(e.into())
            }
        }
    }

    fn engine(&self) -> Result<Rc<dyn Engine>> {
        match &self.state {
            EngineState::Ready(engine) => Ok(engine.clone()),
            _ => Err(Error::NotReady),
        }
    }

    fn lookup_table(&self, name: &str) -> Result<&Table> {
        self.tables.get(name).ok_or_else(|| Error::UnknownTable {
            name: name.to_string(),
        })
    }

    fn lookup_view(&self, name: &str) -> Result<&View> {
        self.views.get(name).ok_or_else(|| Error::ViewNotInitialized {
            name: name.to_string(),
        })
    }

    fn insert_table(&mut self, name: String, table: Table) {
        if let Some(previous) = self.tables.insert(name.clone(), table) {
            log::warn!("Table {} replaced (was {})", name, previous.id());
        }
    }

    fn dispatch(
        &mut self,
        client_id: &str,
        id: u64,
        command: Command,
        sink: &Sink,
    ) -> Result<Option<JsonValue>> {
        match command {
            Command::Init { .. } => Ok(None),
            Command::Table {
                name,
                data,
                binary,
                options,
            } => {
                let data = match (data, binary) {
                    (_, Some(bytes)) => TableData::Binary(bytes),
                    (Some(data), None) => TableData::from_json(data)?,
                    (None, None) => return Err(Error::malformed("table needs data or binary")),
                };
                let table = Table::create(self.engine()?, data, options, &self.settings)?;
                self.insert_table(name, table);
                Ok(Some(JsonValue::Null))
            }
            Command::AddComputed {
                original,
                name,
                computed,
            } => {
                let derived = self.lookup_table(&original)?.add_computed(computed)?;
                self.insert_table(name, derived);
                Ok(Some(JsonValue::Null))
            }
            Command::TableGenerate {
                name,
                generator,
                options,
            } => {
                let table = Table::create(self.engine()?, generator.to_data()?, options, &self.settings)?;
                self.insert_table(name, table);
                Ok(Some(JsonValue::Null))
            }
            Command::TableExecute { name, steps } => {
                let table = self.lookup_table(&name)?;
                for step in steps {
                    match step {
                        TableStep::Update { data } => table.update(TableData::from_json(data)?)?,
                        TableStep::Remove { keys } => {
                            table.remove(keys.into_iter().map(RawValue::from_json).collect())?
                        }
                    }
                }
                Ok(Some(JsonValue::Null))
            }
            Command::View {
                table_name,
                view_name,
                config,
            } => {
                if self.views.contains_key(&view_name) {
                    return Err(Error::DuplicateView { name: view_name });
                }
                let view = self.lookup_table(&table_name)?.view_named(&view_name, config)?;
                self.views.insert(view_name.clone(), view);
                self.view_owners.insert(view_name, client_id.to_string());
                Ok(Some(JsonValue::Null))
            }
            Command::TableMethod {
                name,
                method,
                args,
                subscribe,
            } => {
                check_subscribe(method.is_callback(), subscribe)?;
                self.table_method(client_id, id, &name, method, args, sink)
            }
            Command::ViewMethod {
                name,
                method,
                args,
                subscribe,
            } => {
                check_subscribe(method.is_callback(), subscribe)?;
                self.view_method(client_id, id, &name, method, args, sink)
            }
            Command::ClearViews => Ok(Some(json!(self.clear_views(client_id)))),
        }
    }

    fn table_method(
        &mut self,
        client_id: &str,
        id: u64,
        name: &str,
        method: TableMethod,
        args: JsonValue,
        sink: &Sink,
    ) -> Result<Option<JsonValue>> {
        let table = self.lookup_table(name)?.clone();
        let data = match method {
            TableMethod::Schema => to_json(&table.schema()?)?,
            TableMethod::ComputedSchema => to_json(&table.computed_schema())?,
            TableMethod::Columns => to_json(&table.columns()?)?,
            TableMethod::ColumnMetadata => to_json(&table.column_metadata()?)?,
            TableMethod::Size => json!(table.size()?),
            TableMethod::Update => {
                table.update(TableData::from_json(args)?)?;
                JsonValue::Null
            }
            TableMethod::Remove => {
                let JsonValue::Array(keys) = args else {
                    return Err(Error::protocol("remove expects an array of keys"));
                };
                table.remove(keys.into_iter().map(RawValue::from_json).collect())?;
                JsonValue::Null
            }
            TableMethod::Delete => {
                table.delete()?;
                self.tables.shift_remove(name);
                self.drop_subscriptions(&Target::Table(name.to_string()));
                JsonValue::Null
            }
            TableMethod::OnDelete => {
                let sink = sink.clone();
                let callback = table.on_delete(move || sink(Reply::data(id, JsonValue::Null)));
                self.subscribe(client_id, id, Target::Table(name.to_string()), Hook::TableDelete, callback);
                return Ok(None);
            }
        };
        Ok(Some(data))
    }

    fn view_method(
        &mut self,
        client_id: &str,
        id: u64,
        name: &str,
        method: ViewMethod,
        args: JsonValue,
        sink: &Sink,
    ) -> Result<Option<JsonValue>> {
        let view = self.lookup_view(name)?.clone();
        let data = match method {
            ViewMethod::Schema => to_json(&view.schema()?)?,
            ViewMethod::ToColumns => to_json(&view.to_columns(&viewport(args)?)?)?,
            ViewMethod::ToJson => to_json(&view.to_json(&viewport(args)?)?)?,
            ViewMethod::ToCsv => JsonValue::String(view.to_csv(&viewport(args)?)?),
            ViewMethod::NumRows => json!(view.num_rows()?),
            ViewMethod::NumColumns => json!(view.num_columns()?),
            ViewMethod::Sides => json!(view.sides().count()),
            ViewMethod::GetConfig => to_json(view.config())?,
            ViewMethod::Expand => {
                view.expand(index_arg(&args, "row")?)?;
                JsonValue::Null
            }
            ViewMethod::Collapse => {
                view.collapse(index_arg(&args, "row")?)?;
                JsonValue::Null
            }
            ViewMethod::ExpandToDepth => {
                view.expand_to_depth(index_arg(&args, "depth")?)?;
                JsonValue::Null
            }
            ViewMethod::CollapseToDepth => {
                view.collapse_to_depth(index_arg(&args, "depth")?)?;
                JsonValue::Null
            }
            ViewMethod::Delete => {
                self.remove_view(name);
                view.delete()?;
                JsonValue::Null
            }
            ViewMethod::OnUpdate => {
                let sink = sink.clone();
                let callback = view.on_update(move |delta| {
                    sink(Reply::data(id, delta.cloned().unwrap_or(JsonValue::Null)))
                });
                self.subscribe(client_id, id, Target::View(name.to_string()), Hook::ViewUpdate, callback);
                return Ok(None);
            }
            ViewMethod::OnDelete => {
                let sink = sink.clone();
                let callback = view.on_delete(move || sink(Reply::data(id, JsonValue::Null)));
                self.subscribe(client_id, id, Target::View(name.to_string()), Hook::ViewDelete, callback);
                return Ok(None);
            }
        };
        Ok(Some(data))
    }

    fn subscribe(&mut self, client_id: &str, request: u64, target: Target, hook: Hook, callback: u64) {
        log::debug!("Client {} subscribed {:?} on {:?}", client_id, hook, target);
        self.subscriptions.push(Subscription {
            request,
            client_id: client_id.to_string(),
            target,
            hook,
            callback,
        });
    }

    fn drop_subscriptions(&mut self, target: &Target) {
        self.subscriptions.retain(|s| &s.target != target);
    }

    fn remove_view(&mut self, name: &str) -> Option<View> {
        self.view_owners.remove(name);
        self.drop_subscriptions(&Target::View(name.to_string()));
        self.views.shift_remove(name)
    }

    /// Deletes every view created by `client_id`, logging failures and
    /// carrying on. Returns how many were deleted.
    pub fn clear_views(&mut self, client_id: &str) -> usize {
        let owned: Vec<String> = self
            .view_owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == client_id)
            .map(|(name, _)| name.clone())
            .collect();

        let mut deleted = 0;
        for name in owned {
            let Some(view) = self.remove_view(&name) else {
                continue;
            };
            match view.delete() {
                Ok(()) => deleted += 1,
                Err(e) => log::error!("Failed to delete view {} for client {}: {}", name, client_id, e),
            }
        }
        log::debug!("Cleared {} view(s) of client {}", deleted, client_id);
        deleted
    }

    /// Removes a client's subscriptions, then its views.
    pub fn disconnect(&mut self, client_id: &str) {
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.subscriptions)
            .into_iter()
            .partition(|s| s.client_id == client_id);
        self.subscriptions = rest;

        for sub in mine {
            let removed = match (&sub.target, sub.hook) {
                (Target::Table(name), Hook::TableDelete) => {
                    self.tables.get(name).is_some_and(|t| t.remove_delete(sub.callback))
                }
                (Target::View(name), Hook::ViewUpdate) => {
                    self.views.get(name).is_some_and(|v| v.remove_update(sub.callback))
                }
                (Target::View(name), Hook::ViewDelete) => {
                    self.views.get(name).is_some_and(|v| v.remove_delete(sub.callback))
                }
                _ => false,
            };
            if !removed {
                log::debug!("Subscription {} was already gone", sub.request);
            }
        }
        self.clear_views(client_id);
    }
}

fn check_subscribe(is_callback: bool, subscribe: bool) -> Result<()> {
    match (is_callback, subscribe) {
        (true, false) => Err(Error::protocol("callback methods need subscribe: true")),
        (false, true) => Err(Error::protocol("only callback methods can subscribe")),
        _ => Ok(()),
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<JsonValue> {
    serde_json::to_value(value).map_err(|e| Error::protocol(e.to_string()))
}

fn viewport(args: JsonValue) -> Result<ViewportOptions> {
    if args.is_null() {
        return Ok(ViewportOptions::default());
    }
    serde_json::from_value(args).map_err(|e| Error::protocol(format!("invalid viewport: {}", e)))
}

/// Accepts a bare number or `{key: number}`.
fn index_arg(args: &JsonValue, key: &str) -> Result<usize> {
    args.as_u64()
        .or_else(|| args.get(key).and_then(JsonValue::as_u64))
        .map(|v| v as usize)
        .ok_or_else(|| Error::protocol(format!("expected a non-negative '{}'", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use std::cell::RefCell;

    fn host() -> Host {
        Host::new(
            Settings::default(),
            Box::new(|_: Option<&[u8]>| Ok(Rc::new(MemoryEngine::new()) as Rc<dyn Engine>)),
        )
    }

    fn collector() -> (Sink, Rc<RefCell<Vec<Reply>>>) {
        let replies = Rc::new(RefCell::new(Vec::new()));
        let r = replies.clone();
        (Rc::new(move |reply| r.borrow_mut().push(reply)), replies)
    }

    fn send(host: &mut Host, sink: &Sink, value: JsonValue) {
        host.handle_raw("client-a", &value.to_string(), sink);
    }

    fn ready(host: &mut Host, sink: &Sink) {
        send(host, sink, json!({"id": 0, "cmd": "init"}));
        send(
            host,
            sink,
            json!({"id": 1, "cmd": "table", "name": "t", "data": [{"x": 1, "y": "a"}, {"x": 2, "y": "b"}]}),
        );
    }

    #[test]
    fn test_not_ready_rejects() {
        let mut h = host();
        let (sink, replies) = collector();
        send(&mut h, &sink, json!({"id": 5, "cmd": "table", "name": "t", "data": [{"x": 1}]}));
        let replies = replies.borrow();
        assert_eq!(replies[0].id, Some(5));
        assert_eq!(replies[0].error.as_ref().unwrap()["kind"], "not_ready");
        assert!(h.table("t").is_none());
    }

    #[test]
    fn test_failed_init_stays_uninitialized() {
        let mut h = Host::new(
            Settings::default(),
            Box::new(|_: Option<&[u8]>| {
                Err(crate::engine::EngineError::InitFailed {
                    reason: "no payload".to_string(),
                })
            }),
        );
        let (sink, replies) = collector();
        send(&mut h, &sink, json!({"id": 1, "cmd": "init"}));
        assert!(replies.borrow()[0].is_error());
        assert!(matches!(h.state(), EngineState::Uninitialized));
    }

    #[test]
    fn test_table_schema_round_trip() {
        let mut h = host();
        let (sink, replies) = collector();
        ready(&mut h, &sink);
        send(&mut h, &sink, json!({"id": 2, "cmd": "table_method", "name": "t", "method": "schema"}));
        let replies = replies.borrow();
        assert_eq!(replies[2].data, Some(json!({"x": "integer", "y": "string"})));
    }

    #[test]
    fn test_unknown_view_reply() {
        let mut h = host();
        let (sink, replies) = collector();
        ready(&mut h, &sink);
        send(&mut h, &sink, json!({"id": 9, "cmd": "view_method", "name": "nope", "method": "num_rows"}));
        let reply = replies.borrow()[2].clone();
        assert_eq!(reply.id, Some(9));
        assert_eq!(reply.error.unwrap()["message"], "View is not initialized");
    }

    #[test]
    fn test_unknown_table_error_differs_from_view() {
        let mut h = host();
        let (sink, replies) = collector();
        ready(&mut h, &sink);
        send(&mut h, &sink, json!({"id": 9, "cmd": "table_method", "name": "nope", "method": "size"}));
        let error = replies.borrow()[2].error.clone().unwrap();
        assert_eq!(error["kind"], "unknown_table");
        assert_ne!(error["message"], "View is not initialized");
    }

    #[test]
    fn test_malformed_message_keeps_id() {
        let mut h = host();
        let (sink, replies) = collector();
        send(&mut h, &sink, json!({"id": 4, "cmd": "explode"}));
        h.handle_raw("client-a", "not json", &sink);
        let replies = replies.borrow();
        assert_eq!(replies[0].id, Some(4));
        assert_eq!(replies[0].error.as_ref().unwrap()["kind"], "protocol");
        assert_eq!(replies[1].id, None);
    }

    #[test]
    fn test_subscription_streams_with_request_id() {
        let mut h = host();
        let (sink, replies) = collector();
        ready(&mut h, &sink);
        send(&mut h, &sink, json!({"id": 2, "cmd": "view", "table_name": "t", "view_name": "v"}));
        send(
            &mut h,
            &sink,
            json!({"id": 3, "cmd": "view_method", "name": "v", "method": "on_update", "subscribe": true}),
        );
        send(
            &mut h,
            &sink,
            json!({"id": 4, "cmd": "table_method", "name": "t", "method": "update", "args": [{"x": 3, "y": "c"}]}),
        );
        send(
            &mut h,
            &sink,
            json!({"id": 5, "cmd": "table_method", "name": "t", "method": "update", "args": {"x": [4], "y": ["d"]}}),
        );

        let replies = replies.borrow();
        let events: Vec<&Reply> = replies.iter().filter(|r| r.id == Some(3)).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data.as_ref().unwrap()[0]["y"], "c");
        assert_eq!(events[1].data.as_ref().unwrap()[0]["y"], "d");
    }

    #[test]
    fn test_callback_without_subscribe_rejected() {
        let mut h = host();
        let (sink, replies) = collector();
        ready(&mut h, &sink);
        send(&mut h, &sink, json!({"id": 2, "cmd": "table_method", "name": "t", "method": "on_delete"}));
        assert_eq!(replies.borrow()[2].error.as_ref().unwrap()["kind"], "protocol");
    }

    #[test]
    fn test_table_delete_blocked_by_view() {
        let mut h = host();
        let (sink, replies) = collector();
        ready(&mut h, &sink);
        send(&mut h, &sink, json!({"id": 2, "cmd": "view", "table_name": "t", "view_name": "v"}));
        send(&mut h, &sink, json!({"id": 3, "cmd": "table_method", "name": "t", "method": "delete"}));
        send(&mut h, &sink, json!({"id": 4, "cmd": "view_method", "name": "v", "method": "delete"}));
        send(&mut h, &sink, json!({"id": 5, "cmd": "table_method", "name": "t", "method": "delete"}));

        let replies = replies.borrow();
        assert_eq!(replies[3].error.as_ref().unwrap()["kind"], "table_has_views");
        assert!(!replies[4].is_error());
        assert!(!replies[5].is_error());
        assert!(h.table("t").is_none());
    }

    #[test]
    fn test_clear_views_only_touches_client() {
        let mut h = host();
        let (sink, _replies) = collector();
        ready(&mut h, &sink);
        send(&mut h, &sink, json!({"id": 2, "cmd": "view", "table_name": "t", "view_name": "mine"}));
        h.handle_raw(
            "client-b",
            &json!({"id": 3, "cmd": "view", "table_name": "t", "view_name": "theirs"}).to_string(),
            &sink,
        );

        assert_eq!(h.clear_views("client-a"), 1);
        assert!(h.view("mine").is_none());
        assert!(h.view("theirs").is_some());
        assert_eq!(h.table("t").unwrap().num_views(), 1);
    }

    #[test]
    fn test_disconnect_drops_subscriptions() {
        let mut h = host();
        let (sink, _replies) = collector();
        ready(&mut h, &sink);
        h.handle_raw(
            "client-b",
            &json!({"id": 2, "cmd": "table_method", "name": "t", "method": "on_delete", "subscribe": true})
                .to_string(),
            &sink,
        );
        assert_eq!(h.num_subscriptions(), 1);
        h.disconnect("client-b");
        assert_eq!(h.num_subscriptions(), 0);
    }

    #[test]
    fn test_generate_and_execute() {
        let mut h = host();
        let (sink, replies) = collector();
        send(&mut h, &sink, json!({"id": 0, "cmd": "init"}));
        send(
            &mut h,
            &sink,
            json!({
                "id": 1, "cmd": "table_generate", "name": "g",
                "generator": {"kind": "sequence", "column": "k", "start": 1, "count": 5},
                "options": {"index": "k"}
            }),
        );
        send(
            &mut h,
            &sink,
            json!({
                "id": 2, "cmd": "table_execute", "name": "g",
                "steps": [{"op": "update", "data": [{"k": 6}]}, {"op": "remove", "keys": [1, 2]}]
            }),
        );
        send(&mut h, &sink, json!({"id": 3, "cmd": "table_method", "name": "g", "method": "size"}));
        let replies = replies.borrow();
        assert!(replies.iter().all(|r| !r.is_error()), "{:?}", replies);
        assert_eq!(replies[3].data, Some(json!(4)));
    }

    #[test]
    fn test_add_computed_command() {
        let mut h = host();
        let (sink, replies) = collector();
        ready(&mut h, &sink);
        send(
            &mut h,
            &sink,
            json!({
                "id": 2, "cmd": "add_computed", "original": "t", "name": "t2",
                "computed": [{"column": "upper", "func": "uppercase", "inputs": ["y"], "type": "string"}]
            }),
        );
        send(&mut h, &sink, json!({"id": 3, "cmd": "table_method", "name": "t2", "method": "columns"}));
        let replies = replies.borrow();
        assert_eq!(replies[3].data, Some(json!(["x", "y", "upper"])));
    }
}
