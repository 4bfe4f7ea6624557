//! Running commands through the Task Scheduler.
//!
//! Commands started over WinRM run in a restricted network logon that cannot,
//! for example, install services or use Windows Update. Registering the command
//! as a scheduled task for the same user gets a full interactive token. The
//! wrapper script below registers the task, starts it, relays the log file it
//! writes and exits with the task's result.

use quick_xml::escape::escape;
use wincast_wsman::powershell;

/// Wrappers are uploaded into this directory, one file per command.
const SCRIPT_DIR: &str = "C:/Windows/Temp";

const TEMPLATE: &str = r#"$ErrorActionPreference = 'Stop'
$user = {{USER}}
$password = {{PASSWORD}}
$encoded_command = '{{ENCODED_COMMAND}}'

$task_name = "wincast-elevated-shell-{{ID}}"
$out_file = "$env:TEMP\wincast-elevated-shell-{{ID}}.log"

if (Test-Path $out_file) {
  Remove-Item $out_file -Force
}

$task_xml = @'
<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <Principals>
    <Principal id="Author">
      <UserId>{{USER_XML}}</UserId>
      <LogonType>Password</LogonType>
      <RunLevel>HighestAvailable</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <AllowHardTerminate>true</AllowHardTerminate>
    <StartWhenAvailable>false</StartWhenAvailable>
    <RunOnlyIfNetworkAvailable>false</RunOnlyIfNetworkAvailable>
    <IdleSettings>
      <StopOnIdleEnd>false</StopOnIdleEnd>
      <RestartOnIdle>false</RestartOnIdle>
    </IdleSettings>
    <AllowStartOnDemand>true</AllowStartOnDemand>
    <Enabled>true</Enabled>
    <Hidden>false</Hidden>
    <RunOnlyIfIdle>false</RunOnlyIfIdle>
    <WakeToRun>false</WakeToRun>
    <ExecutionTimeLimit>PT2H</ExecutionTimeLimit>
    <Priority>4</Priority>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>cmd</Command>
      <Arguments>{arguments}</Arguments>
    </Exec>
  </Actions>
</Task>
'@

$arguments = "/c powershell.exe -NoProfile -EncodedCommand $encoded_command &gt; `"$out_file`" 2&gt;&amp;1"
$task_xml = $task_xml.Replace("{arguments}", $arguments)

$schedule = New-Object -ComObject "Schedule.Service"
$schedule.Connect()
$task = $schedule.NewTask($null)
$task.XmlText = $task_xml
$folder = $schedule.GetFolder("\")
$folder.RegisterTaskDefinition($task_name, $task, 6, $user, $password, 1, $null) | Out-Null

$registered_task = $folder.GetTask("\$task_name")
$registered_task.Run($null) | Out-Null

# Give the task up to 10 seconds to start running
$sec = 0
while ((!($registered_task.State -eq 4)) -and ($sec -lt 10)) {
  Start-Sleep -Seconds 1
  $sec++
}

function SlurpOutput($out_file, $cur_line) {
  if (Test-Path $out_file) {
    Get-Content $out_file | Select-Object -Skip $cur_line | ForEach-Object {
      $cur_line += 1
      Write-Host "$_"
    }
  }
  return $cur_line
}

# The task is back to ready (3) once it finished
$cur_line = 0
do {
  Start-Sleep -Milliseconds 100
  $cur_line = SlurpOutput $out_file $cur_line
} while (!($registered_task.State -eq 3))
$cur_line = SlurpOutput $out_file $cur_line

$exit_code = $registered_task.LastTaskResult
$folder.DeleteTask($task_name, 0)
[System.Runtime.Interopservices.Marshal]::ReleaseComObject($schedule) | Out-Null

exit $exit_code
"#;

/// A rendered wrapper and where it goes on the remote machine.
pub struct ElevatedScript {
    pub id: String,
    pub path: String,
    pub contents: String,
}

impl ElevatedScript {
    pub fn new(command: &str, user: &str, password: &str) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self::with_id(id, command, user, password)
    }

    fn with_id(id: String, command: &str, user: &str, password: &str) -> Self {
        // Propagate the exit code of native programs through powershell.exe
        let wrapped = format!("{command}; exit $LASTEXITCODE");
        let encoded = powershell::encode_command(&wrapped);
        let user_xml = escape(user);
        let user_quoted = powershell::quote(user);
        let password_quoted = powershell::quote(password);

        let contents = render(TEMPLATE, |name| match name {
            "ID" => Some(id.as_str()),
            "ENCODED_COMMAND" => Some(encoded.as_str()),
            "USER_XML" => Some(&*user_xml),
            "USER" => Some(user_quoted.as_str()),
            "PASSWORD" => Some(password_quoted.as_str()),
            _ => None,
        });

        Self {
            path: format!("{SCRIPT_DIR}/wincast-elevated-shell-{id}.ps1"),
            id,
            contents,
        }
    }

    /// The command line that runs the uploaded wrapper.
    pub fn command(&self) -> String {
        format!(
            "powershell -NoProfile -ExecutionPolicy Bypass -File \"{}\"",
            self.path.replace('/', "\\")
        )
    }
}

/// Substitute `{{NAME}}` placeholders in a single pass. Substituted text is
/// never scanned again, and unknown placeholders are left alone.
fn render<'a>(template: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after
            .find("}}")
            .and_then(|close| lookup(&after[..close]).map(|value| (close, value)))
        {
            Some((close, value)) => {
                rendered.push_str(value);
                rest = &after[close + 2..];
            }
            None => {
                rendered.push_str("{{");
                rest = after;
            }
        }
    }
    rendered.push_str(rest);
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elevated_script() {
        let script = ElevatedScript::new("net start \"my svc\"", "O'Brien & co", "pa'ss");
        let contents = &script.contents;

        assert!(contents.contains("$user = 'O''Brien & co'"));
        assert!(contents.contains("$password = 'pa''ss'"));
        assert!(contents.contains("<UserId>O&apos;Brien &amp; co</UserId>"));
        assert!(!contents.contains("{{"), "unrendered placeholder");
        assert!(contents.contains(&format!("wincast-elevated-shell-{}", script.id)));

        // The command only appears encoded
        assert!(!contents.contains("my svc"));
        let encoded = powershell::encode_command("net start \"my svc\"; exit $LASTEXITCODE");
        assert!(contents.contains(&format!("$encoded_command = '{encoded}'")));
    }

    #[test]
    fn test_substituted_text_is_not_rendered_again() {
        let script = ElevatedScript::new("whoami", "{{PASSWORD}}", "{{ID}}");
        let contents = &script.contents;

        assert!(contents.contains("$user = '{{PASSWORD}}'"));
        assert!(contents.contains("$password = '{{ID}}'"));
        assert!(contents.contains("<UserId>{{PASSWORD}}</UserId>"));
        assert!(!contents.contains(&format!("$user = '{}'", script.id)));
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let rendered = render("{{A}} {{B}} {{A", |name| (name == "A").then_some("x"));
        assert_eq!(rendered, "x {{B}} {{A");
    }

    #[test]
    fn test_scripts_do_not_share_a_path() {
        let first = ElevatedScript::new("whoami", "u", "p");
        let second = ElevatedScript::new("whoami", "u", "p");
        assert_ne!(first.path, second.path);
    }

    #[test]
    fn test_elevated_command() {
        let script = ElevatedScript::with_id(String::from("abc123"), "whoami", "u", "p");
        assert_eq!(
            script.command(),
            "powershell -NoProfile -ExecutionPolicy Bypass -File \"C:\\Windows\\Temp\\wincast-elevated-shell-abc123.ps1\""
        );
    }
}
