//! Topic names for the central and local bus

/// Devices announce themselves here on the central bus
pub const DISCOVERY_TOPIC: &str = "controller/discovery";

/// Replies with local bus coordinates go here
pub const RESPONSE_TOPIC: &str = "controller/response";

/// Inbound topic on the local bus, as seen by the registration handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalTopic<'a> {
    Register,
    Button(&'a str),
    Joystick(&'a str),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn register(&self) -> String {
        format!("{}/register", self.base)
    }

    pub fn getid(&self) -> String {
        format!("{}/getid", self.base)
    }

    pub fn button(&self, id: &str) -> String {
        format!("{}/{}/button", self.base, id)
    }

    pub fn joystick(&self, id: &str) -> String {
        format!("{}/{}/joystick", self.base, id)
    }

    pub fn classify<'a>(&self, topic: &'a str) -> LocalTopic<'a> {
        let Some(rest) = topic
            .strip_prefix(self.base.as_str())
            .and_then(|r| r.strip_prefix('/'))
        else {
            return LocalTopic::Unknown;
        };

        if rest == "register" {
            return LocalTopic::Register;
        }

        match rest.split_once('/') {
            Some((id, "button")) if !id.is_empty() => LocalTopic::Button(id),
            Some((id, "joystick")) if !id.is_empty() => LocalTopic::Joystick(id),
            _ => LocalTopic::Unknown,
        }
    }
}
