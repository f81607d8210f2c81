//! Command handling for client control commands (prefixed with `:`)

use crate::protocol::Request;
use crate::session::{CaseRef, Role, UserId};
use anyhow::{anyhow, bail, Result};

/// What a control command asks the console to do
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Send a request to the server
    Send(Request),
    /// Print the command list
    Help,
    /// Leave the session and exit
    Exit,
}

pub const HELP: &str = "\
:start               start the session (host or doctor)
:skip                skip the rest of the reading phase (doctor)
:end                 end the consultation (doctor)
:feedback USER TEXT  give feedback to USER (patient or observer)
:complete            complete the session without waiting for feedback
:role ROLE           change role while waiting
:case [ID]           pick case ID, or draw a random unused case
:state               print the current session state
:endsession          end the session for everyone (host)
:leave | :quit       leave the session and exit
anything else        chat";

/// Translate a control command into the action it stands for.
pub fn handle_control_command(command: &str, args: &[String]) -> Result<CommandResult> {
    let request = match command {
        "start" => Request::Start,
        "skip" => Request::SkipPhase,
        "end" => Request::EndConsultation,
        "complete" => Request::ForceComplete,
        "endsession" => Request::EndSession,
        "state" | "snapshot" => Request::Snapshot { code: None },
        "role" => {
            let [role] = args else {
                bail!("Usage: :role <doctor|patient|observer|host>");
            };
            Request::AssignRole {
                role: role.parse::<Role>()?,
            }
        }
        "feedback" => {
            let Some((to, text)) = args.split_first() else {
                bail!("Usage: :feedback <user> <text>");
            };
            if text.is_empty() {
                bail!("Usage: :feedback <user> <text>");
            }
            Request::SubmitFeedback {
                to: UserId::new(to.clone()),
                payload: serde_json::json!({ "comment": text.join(" ") }),
            }
        }
        "case" => match args {
            [] => Request::NewCase,
            [id] => Request::SelectCase {
                case: CaseRef::new(id.clone()),
            },
            _ => bail!("Usage: :case [case-id]"),
        },
        "help" | "?" => return Ok(CommandResult::Help),
        "leave" | "quit" | "q" => return Ok(CommandResult::Exit),
        other => return Err(anyhow!("Unknown command ':{}' (try :help)", other)),
    };
    Ok(CommandResult::Send(request))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(
            handle_control_command("skip", &[]).unwrap(),
            CommandResult::Send(Request::SkipPhase)
        );
        assert_eq!(
            handle_control_command("quit", &[]).unwrap(),
            CommandResult::Exit
        );
    }

    #[test]
    fn test_role_command() {
        assert_eq!(
            handle_control_command("role", &args(&["Observer"])).unwrap(),
            CommandResult::Send(Request::AssignRole {
                role: Role::Observer
            })
        );
        assert!(handle_control_command("role", &[]).is_err());
        assert!(handle_control_command("role", &args(&["nurse"])).is_err());
    }

    #[test]
    fn test_feedback_command() {
        let result = handle_control_command("feedback", &args(&["doc", "good", "rapport"])).unwrap();
        let CommandResult::Send(Request::SubmitFeedback { to, payload }) = result else {
            panic!("expected feedback request");
        };
        assert_eq!(to, UserId::new("doc"));
        assert_eq!(payload["comment"], "good rapport");

        assert!(handle_control_command("feedback", &args(&["doc"])).is_err());
    }

    #[test]
    fn test_case_command() {
        assert_eq!(
            handle_control_command("case", &[]).unwrap(),
            CommandResult::Send(Request::NewCase)
        );
        assert!(matches!(
            handle_control_command("case", &args(&["aki-01"])).unwrap(),
            CommandResult::Send(Request::SelectCase { .. })
        ));
    }

    #[test]
    fn test_unknown_command() {
        assert!(handle_control_command("kill", &[]).is_err());
    }
}
