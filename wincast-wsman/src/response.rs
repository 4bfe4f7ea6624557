//! Parsing of WS-Management responses. Element names are matched by local name
//! so that whatever prefixes the service picks do not matter.

use base64::{Engine, engine::general_purpose::STANDARD};
use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};

use crate::error::{Error, Result};

/// Which output stream a chunk belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Output collected from a single Receive response.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReceiveOutput {
    pub chunks: Vec<(StreamName, Vec<u8>)>,
    pub done: bool,
    pub exit_code: Option<i32>,
}

fn malformed(error: impl std::fmt::Display) -> Error {
    Error::Malformed(error.to_string())
}

fn attribute(element: &BytesStart, name: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(malformed)?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value().map_err(malformed)?.into_owned()));
        }
    }
    Ok(None)
}

/// Collect the text of the first element with the given local name, optionally
/// requiring an attribute value.
fn element_text(xml: &str, local: &[u8], with_attr: Option<(&[u8], &str)>) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut inside = false;
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) if e.local_name().as_ref() == local => {
                inside = match with_attr {
                    Some((name, value)) => attribute(&e, name)?.as_deref() == Some(value),
                    None => true,
                };
            }
            Event::Text(t) if inside => {
                return Ok(Some(t.unescape().map_err(malformed)?.into_owned()));
            }
            Event::End(e) if inside && e.local_name().as_ref() == local => return Ok(None),
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Extract the shell id from a Create response.
pub fn shell_id(xml: &str) -> Result<String> {
    if let Some(id) = element_text(xml, b"ShellId", None)? {
        return Ok(id);
    }
    element_text(xml, b"Selector", Some((b"Name", "ShellId")))?
        .ok_or_else(|| Error::Malformed("no ShellId in create response".into()))
}

/// Extract the command id from a Command response.
pub fn command_id(xml: &str) -> Result<String> {
    element_text(xml, b"CommandId", None)?
        .ok_or_else(|| Error::Malformed("no CommandId in command response".into()))
}

/// Decode the streams, state and exit code of a Receive response.
pub fn receive_output(xml: &str) -> Result<ReceiveOutput> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut output = ReceiveOutput::default();
    let mut stream: Option<StreamName> = None;
    let mut in_exit_code = false;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"Stream" => {
                    stream = match attribute(&e, b"Name")?.as_deref() {
                        Some("stdout") => Some(StreamName::Stdout),
                        Some("stderr") => Some(StreamName::Stderr),
                        _ => None,
                    };
                }
                b"CommandState" => {
                    if let Some(state) = attribute(&e, b"State")? {
                        output.done = state.ends_with("/Done");
                    }
                }
                b"ExitCode" => in_exit_code = true,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"CommandState" => {
                if let Some(state) = attribute(&e, b"State")? {
                    output.done = state.ends_with("/Done");
                }
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(malformed)?;
                if let Some(name) = stream {
                    let data = STANDARD.decode(text.as_bytes()).map_err(malformed)?;
                    if !data.is_empty() {
                        output.chunks.push((name, data));
                    }
                } else if in_exit_code {
                    output.exit_code = Some(text.trim().parse().map_err(malformed)?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"Stream" => stream = None,
                b"ExitCode" => in_exit_code = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(output)
}

/// Build an error from a SOAP fault body, if it is one.
pub fn fault(xml: &str) -> Option<Error> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut is_fault = false;
    let mut code: Option<String> = None;
    let mut message: Option<String> = None;
    let mut capture = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Fault" => is_fault = true,
                b"WSManFault" => code = attribute(&e, b"Code").ok().flatten(),
                b"Message" | b"Text" if message.is_none() => capture = true,
                _ => {}
            },
            Ok(Event::Text(t)) if capture => {
                message = t.unescape().ok().map(|m| m.trim().to_string());
                capture = false;
            }
            Ok(Event::End(_)) => capture = false,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    is_fault.then(|| Error::Fault {
        code: code.unwrap_or_default(),
        message: message.unwrap_or_default(),
    })
}
