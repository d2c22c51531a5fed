use std::fmt;

use rhai::{Dynamic, Engine, Map};

use crate::refcount::Handle;

/// Well-known global events a game module can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Init,
    Release,
    Tick,
    FrameBegin,
    FrameEnd,
    ShowGui,
    HideGui,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::Init,
        EventType::Release,
        EventType::Tick,
        EventType::FrameBegin,
        EventType::FrameEnd,
        EventType::ShowGui,
        EventType::HideGui,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventType::Init => "Init",
            EventType::Release => "Release",
            EventType::Tick => "Tick",
            EventType::FrameBegin => "FrameBegin",
            EventType::FrameEnd => "FrameEnd",
            EventType::ShowGui => "ShowGui",
            EventType::HideGui => "HideGui",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.name() == name)
    }

    pub fn listener(self) -> ListenerKind {
        match self {
            EventType::Init => ListenerKind::OnInit,
            EventType::Release => ListenerKind::OnRelease,
            EventType::Tick => ListenerKind::OnTick,
            EventType::FrameBegin => ListenerKind::OnFrameBegin,
            EventType::FrameEnd => ListenerKind::OnFrameEnd,
            EventType::ShowGui => ListenerKind::OnShow,
            EventType::HideGui => ListenerKind::OnHide,
        }
    }
}

/// Listener names recognized in `@Listener="..."` annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    OnInit,
    OnRelease,
    OnTick,
    OnFrameBegin,
    OnFrameEnd,
    OnShow,
    OnHide,
    OnClick,
    OnValueChange,
    OnSubmit,
    OnCloseClicked,
    OnListenUpdate,
    Generic,
}

impl ListenerKind {
    const ALL: [ListenerKind; 13] = [
        ListenerKind::OnInit,
        ListenerKind::OnRelease,
        ListenerKind::OnTick,
        ListenerKind::OnFrameBegin,
        ListenerKind::OnFrameEnd,
        ListenerKind::OnShow,
        ListenerKind::OnHide,
        ListenerKind::OnClick,
        ListenerKind::OnValueChange,
        ListenerKind::OnSubmit,
        ListenerKind::OnCloseClicked,
        ListenerKind::OnListenUpdate,
        ListenerKind::Generic,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ListenerKind::OnInit => "OnInit",
            ListenerKind::OnRelease => "OnRelease",
            ListenerKind::OnTick => "OnTick",
            ListenerKind::OnFrameBegin => "OnFrameBegin",
            ListenerKind::OnFrameEnd => "OnFrameEnd",
            ListenerKind::OnShow => "OnShow",
            ListenerKind::OnHide => "OnHide",
            ListenerKind::OnClick => "OnClick",
            ListenerKind::OnValueChange => "OnValueChange",
            ListenerKind::OnSubmit => "OnSubmit",
            ListenerKind::OnCloseClicked => "OnCloseClicked",
            ListenerKind::OnListenUpdate => "OnListenUpdate",
            ListenerKind::Generic => "Generic",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Global event this listener subscribes to. GUI-only listeners have none.
    pub fn event_type(self) -> Option<EventType> {
        EventType::ALL.into_iter().find(|event| event.listener() == self)
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Builtin(EventType),
    Generic(String),
}

/// Event delivered to script listeners. Shared with scripts as `Handle<Event>`.
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    payload: Map,
}

impl Event {
    pub fn new(event: EventType) -> Self {
        Self { kind: EventKind::Builtin(event), payload: Map::new() }
    }

    pub fn generic(type_name: impl Into<String>) -> Self {
        Self { kind: EventKind::Generic(type_name.into()), payload: Map::new() }
    }

    pub fn with<T: Clone + Send + Sync + 'static>(mut self, key: &str, value: T) -> Self {
        self.payload.insert(key.into(), Dynamic::from(value));
        self
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn type_name(&self) -> &str {
        match &self.kind {
            EventKind::Builtin(event) => event.name(),
            EventKind::Generic(name) => name,
        }
    }

    pub fn payload(&self) -> &Map {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Dynamic> {
        self.payload.get(key)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EventKind::Builtin(event) => write!(f, "{}", event.name())?,
            EventKind::Generic(name) => write!(f, "Generic({name})")?,
        }
        if !self.payload.is_empty() {
            let keys: Vec<&str> = self.payload.keys().map(|key| key.as_str()).collect();
            write!(f, " [{}]", keys.join(", "))?;
        }
        Ok(())
    }
}

pub(crate) fn register_script_api(engine: &mut Engine) {
    engine.register_type_with_name::<Handle<Event>>("Event");
    engine.register_get("kind", |event: &mut Handle<Event>| event.type_name().to_string());
    engine.register_get("is_generic", |event: &mut Handle<Event>| matches!(event.kind(), EventKind::Generic(_)));
    engine.register_get("payload", |event: &mut Handle<Event>| event.payload().clone());
    engine.register_fn("get", |event: &mut Handle<Event>, key: &str| event.get(key).cloned().unwrap_or(Dynamic::UNIT));
    engine.register_fn("to_string", |event: &mut Handle<Event>| event.to_string());
}
