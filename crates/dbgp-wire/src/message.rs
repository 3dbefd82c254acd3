use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::types::{BreakLocation, DbgpError, EngineStatus, Result, TransactionId};

/// A decoded engine → IDE packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Init(InitPacket),
    Response(Response),
    Stream(StreamPacket),
    Notify(Notify),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPacket {
    /// Entry script as a `file://` URI.
    pub file_uri: String,
    pub language: Option<String>,
    pub protocol_version: Option<String>,
    pub app_id: Option<String>,
    pub idekey: Option<String>,
    pub engine: Option<String>,
    pub engine_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub command: String,
    pub transaction_id: TransactionId,
    pub status: Option<EngineStatus>,
    pub reason: Option<String>,
    pub success: Option<bool>,
    /// Engine-assigned id, present on `breakpoint_set` responses.
    pub breakpoint_id: Option<String>,
    pub location: Option<BreakLocation>,
    pub error: Option<EngineError>,
    pub properties: Vec<Property>,
}

impl Response {
    /// Turn an `<error>` element into [`DbgpError::Command`].
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(err) => Err(DbgpError::Command {
                command: self.command,
                code: err.code,
                message: err.message,
            }),
            None => Ok(self),
        }
    }
}

/// One node of a `property_get` / `context_get` / `eval` value tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub fullname: Option<String>,
    /// DBGp data type (`int`, `string`, `array`, `object`, `null`, ...).
    pub kind: String,
    pub classname: Option<String>,
    pub facet: Option<String>,
    /// Scalar value, already base64-decoded.
    pub value: Option<String>,
    /// Total number of children on the engine side; `children` may hold fewer
    /// when the engine's `max_depth`/`max_children` cut the tree short.
    pub num_children: u32,
    pub children: Vec<Property>,
}

impl Property {
    pub fn has_children(&self) -> bool {
        self.num_children > 0 || !self.children.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    /// `stdout` or `stderr`.
    pub kind: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub name: String,
}

fn strip_xml_declaration(text: &str) -> &str {
    let trimmed = text.trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return &trimmed[end + 2..];
        }
    }
    trimmed
}

fn attr(node: &roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    node.attribute(name).map(str::to_string)
}

fn parse_u32_attr(node: &roxmltree::Node<'_, '_>, name: &str) -> Result<Option<u32>> {
    node.attribute(name)
        .map(|raw| {
            raw.trim().parse::<u32>().map_err(|err| {
                DbgpError::Protocol(format!("invalid `{name}` attribute {raw:?}: {err}"))
            })
        })
        .transpose()
}

fn child_element<'a, 'input>(
    node: &roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn own_text(node: &roxmltree::Node<'_, '_>) -> String {
    node.children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

fn decode_text(node: &roxmltree::Node<'_, '_>) -> Result<String> {
    let text = own_text(node);
    if node.attribute("encoding") == Some("base64") {
        let compact: String = text.split_whitespace().collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|err| DbgpError::Protocol(format!("invalid base64 payload: {err}")))?;
        return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(text)
}

/// Decode one frame payload.
pub fn parse_message(payload: &[u8]) -> Result<Message> {
    let text = String::from_utf8_lossy(payload);
    let doc = roxmltree::Document::parse(strip_xml_declaration(&text))
        .map_err(|err| DbgpError::Protocol(format!("invalid XML packet: {err}")))?;
    let root = doc.root_element();

    match root.tag_name().name() {
        "init" => parse_init(&root).map(Message::Init),
        "response" => parse_response(&root).map(Message::Response),
        "stream" => Ok(Message::Stream(StreamPacket {
            kind: attr(&root, "type").unwrap_or_else(|| "stdout".to_string()),
            data: decode_text(&root)?,
        })),
        "notify" => Ok(Message::Notify(Notify {
            name: attr(&root, "name").unwrap_or_default(),
        })),
        other => Err(DbgpError::Protocol(format!(
            "unexpected packet element <{other}>"
        ))),
    }
}

fn parse_init(node: &roxmltree::Node<'_, '_>) -> Result<InitPacket> {
    let file_uri = attr(node, "fileuri")
        .ok_or_else(|| DbgpError::Protocol("init packet has no fileuri".to_string()))?;
    let engine = child_element(node, "engine");
    Ok(InitPacket {
        file_uri,
        language: attr(node, "language"),
        protocol_version: attr(node, "protocol_version"),
        app_id: attr(node, "appid"),
        idekey: attr(node, "idekey"),
        engine: engine
            .as_ref()
            .map(own_text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        engine_version: engine.as_ref().and_then(|e| attr(e, "version")),
    })
}

fn parse_response(node: &roxmltree::Node<'_, '_>) -> Result<Response> {
    let transaction_id = parse_u32_attr(node, "transaction_id")?.ok_or_else(|| {
        DbgpError::Protocol("response packet has no transaction_id".to_string())
    })?;

    let status = match node.attribute("status") {
        Some(raw) => Some(EngineStatus::parse(raw).ok_or_else(|| {
            DbgpError::Protocol(format!("unknown engine status {raw:?}"))
        })?),
        None => None,
    };

    let error = match child_element(node, "error") {
        Some(err) => Some(EngineError {
            code: parse_u32_attr(&err, "code")?.unwrap_or(0),
            message: child_element(&err, "message")
                .map(|m| own_text(&m).trim().to_string())
                .unwrap_or_default(),
        }),
        None => None,
    };

    let location = match child_element(node, "message") {
        Some(msg) => match msg.attribute("filename") {
            Some(file_uri) => Some(BreakLocation {
                file_uri: file_uri.to_string(),
                line: parse_u32_attr(&msg, "lineno")?.unwrap_or(0),
                exception: attr(&msg, "exception"),
                message: Some(own_text(&msg).trim().to_string()).filter(|m| !m.is_empty()),
            }),
            None => None,
        },
        None => None,
    };

    let properties = node
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "property")
        .map(|n| parse_property(&n))
        .collect::<Result<Vec<_>>>()?;

    Ok(Response {
        command: attr(node, "command").unwrap_or_default(),
        transaction_id,
        status,
        reason: attr(node, "reason"),
        success: node.attribute("success").map(|s| s == "1"),
        breakpoint_id: attr(node, "id"),
        location,
        error,
        properties,
    })
}

fn parse_property(node: &roxmltree::Node<'_, '_>) -> Result<Property> {
    let children = node
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "property")
        .map(|n| parse_property(&n))
        .collect::<Result<Vec<_>>>()?;

    let value = if children.is_empty() {
        let decoded = decode_text(node)?;
        let kind = node.attribute("type").unwrap_or_default();
        // Structured values carry no scalar text; keep empty strings only
        // where they are meaningful.
        if decoded.is_empty() && kind != "string" {
            None
        } else {
            Some(decoded)
        }
    } else {
        None
    };

    Ok(Property {
        name: attr(node, "name").unwrap_or_default(),
        fullname: attr(node, "fullname"),
        kind: attr(node, "type").unwrap_or_else(|| "undefined".to_string()),
        classname: attr(node, "classname"),
        facet: attr(node, "facet"),
        value,
        num_children: parse_u32_attr(node, "numchildren")?.unwrap_or(0),
        children,
    })
}
