//! SOAP request envelopes for the Windows remote shell resource.

use quick_xml::escape::escape;
use std::fmt::Write;

use crate::{Parameters, duration::iso8601};

pub const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
pub const NS_WSMAN_MS: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd";
pub const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

pub const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

pub const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
pub const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
pub const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
pub const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
pub const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

pub const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

/// A single request ready to be rendered.
struct Envelope<'a> {
    to: &'a str,
    action: &'a str,
    params: &'a Parameters,
    shell_id: Option<&'a str>,
    options: &'a [(&'a str, &'a str)],
    body: String,
}

impl Envelope<'_> {
    fn render(&self) -> String {
        let mut xml = String::with_capacity(2048 + self.body.len());
        let _ = write!(
            xml,
            r#"<?xml version="1.0" encoding="UTF-8"?><env:Envelope xmlns:env="{NS_SOAP}" xmlns:a="{NS_ADDRESSING}" xmlns:w="{NS_WSMAN}" xmlns:p="{NS_WSMAN_MS}" xmlns:rsp="{NS_SHELL}"><env:Header>"#
        );
        let _ = write!(
            xml,
            r#"<a:To>{}</a:To><a:ReplyTo><a:Address env:mustUnderstand="true">{ANONYMOUS}</a:Address></a:ReplyTo>"#,
            escape(self.to)
        );
        let _ = write!(
            xml,
            r#"<w:MaxEnvelopeSize env:mustUnderstand="true">{}</w:MaxEnvelopeSize>"#,
            self.params.envelope_size
        );
        let _ = write!(
            xml,
            r#"<a:MessageID>uuid:{}</a:MessageID>"#,
            uuid::Uuid::new_v4().to_string().to_uppercase()
        );
        let locale = escape(&self.params.locale);
        let _ = write!(
            xml,
            r#"<w:Locale xml:lang="{locale}" env:mustUnderstand="false"/><p:DataLocale xml:lang="{locale}" env:mustUnderstand="false"/>"#
        );
        let _ = write!(
            xml,
            r#"<w:OperationTimeout>{}</w:OperationTimeout>"#,
            iso8601(self.params.timeout)
        );
        let _ = write!(
            xml,
            r#"<w:ResourceURI env:mustUnderstand="true">{RESOURCE_CMD}</w:ResourceURI><a:Action env:mustUnderstand="true">{}</a:Action>"#,
            self.action
        );
        if let Some(shell_id) = self.shell_id {
            let _ = write!(
                xml,
                r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                escape(shell_id)
            );
        }
        if !self.options.is_empty() {
            xml.push_str("<w:OptionSet>");
            for (name, value) in self.options {
                let _ = write!(xml, r#"<w:Option Name="{name}">{value}</w:Option>"#);
            }
            xml.push_str("</w:OptionSet>");
        }
        xml.push_str("</env:Header><env:Body>");
        xml.push_str(&self.body);
        xml.push_str("</env:Body></env:Envelope>");
        xml
    }
}

/// Open a new `cmd` shell with stdin/stdout/stderr streams.
pub fn create_shell(to: &str, params: &Parameters) -> String {
    Envelope {
        to,
        action: ACTION_CREATE,
        params,
        shell_id: None,
        options: &[("WINRS_NOPROFILE", "FALSE"), ("WINRS_CODEPAGE", "65001")],
        body: String::from(
            "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>",
        ),
    }
    .render()
}

/// Run a command line inside an existing shell.
pub fn command(to: &str, params: &Parameters, shell_id: &str, command_line: &str) -> String {
    Envelope {
        to,
        action: ACTION_COMMAND,
        params,
        shell_id: Some(shell_id),
        options: &[
            ("WINRS_CONSOLEMODE_STDIN", "TRUE"),
            ("WINRS_SKIP_CMD_SHELL", "FALSE"),
        ],
        body: format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            escape(command_line)
        ),
    }
    .render()
}

/// Poll for output of a running command.
pub fn receive(to: &str, params: &Parameters, shell_id: &str, command_id: &str) -> String {
    Envelope {
        to,
        action: ACTION_RECEIVE,
        params,
        shell_id: Some(shell_id),
        options: &[],
        body: format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            escape(command_id)
        ),
    }
    .render()
}

/// Send a signal (usually terminate) to a command.
pub fn signal(
    to: &str,
    params: &Parameters,
    shell_id: &str,
    command_id: &str,
    code: &str,
) -> String {
    Envelope {
        to,
        action: ACTION_SIGNAL,
        params,
        shell_id: Some(shell_id),
        options: &[],
        body: format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{code}</rsp:Code></rsp:Signal>"#,
            escape(command_id)
        ),
    }
    .render()
}

/// Delete a shell and everything running in it.
pub fn delete_shell(to: &str, params: &Parameters, shell_id: &str) -> String {
    Envelope {
        to,
        action: ACTION_DELETE,
        params,
        shell_id: Some(shell_id),
        options: &[],
        body: String::new(),
    }
    .render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> Parameters {
        Parameters {
            timeout: Duration::from_secs(1200),
            ..Parameters::default()
        }
    }

    #[test]
    fn test_create_shell() {
        let xml = create_shell("http://localhost:5985/wsman", &params());

        assert!(xml.contains(ACTION_CREATE));
        assert!(xml.contains("<w:OperationTimeout>PT20M</w:OperationTimeout>"));
        assert!(xml.contains("<w:MaxEnvelopeSize env:mustUnderstand=\"true\">153600</w:MaxEnvelopeSize>"));
        assert!(xml.contains(r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option>"#));
        assert!(!xml.contains("SelectorSet"), "create must not target a shell");
    }

    #[test]
    fn test_command_is_escaped() {
        let xml = command(
            "http://localhost:5985/wsman",
            &params(),
            "SHELL-1",
            r#"echo "a" & echo <b>"#,
        );

        assert!(xml.contains(r#"<w:Selector Name="ShellId">SHELL-1</w:Selector>"#));
        assert!(xml.contains("echo &quot;a&quot; &amp; echo &lt;b&gt;"));
    }

    #[test]
    fn test_receive_targets_command() {
        let xml = receive("http://localhost:5985/wsman", &params(), "S", "C-42");
        assert!(xml.contains(r#"CommandId="C-42">stdout stderr</rsp:DesiredStream>"#));
    }
}
