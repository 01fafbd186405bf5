use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use capa_shared::error::CommonError;
use capa_shared::types::CommandToolDef;
use capa_shared::variables::{substitute_arg_placeholders, substitute_variables};
use capa_store::repository::{ToolInitRepositoryLike, VariableRepositoryLike};
use serde_json::{Map, Value, json};
use tokio::process::Command;

/// 60s hard timeout on every command-tool invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs `type="command"` tools as local shell processes, handling the one-shot
/// `def.init` run and `{argName}`/`${Var}` substitution ahead of execution.
pub struct Executor<R> {
    store: Arc<R>,
}

impl<R> Executor<R>
where
    R: VariableRepositoryLike + ToolInitRepositoryLike + Send + Sync + 'static,
{
    pub fn new(store: Arc<R>) -> Self {
        Self { store }
    }

    /// Runs `def.init` once (if present and not already initialized) and then `def.run`,
    /// substituting `{argName}` from `arguments` and `${Var}` from project variables.
    /// Never returns a `CommonError` for a failed *run* of the command — only for
    /// configuration problems (missing required argument, unresolved variable); a
    /// failed command execution is a tool result, `{success:false, error}`.
    pub async fn run_command_tool(
        &self,
        project_id: &str,
        tool_id: &str,
        def: &CommandToolDef,
        arguments: &Map<String, Value>,
    ) -> Result<Value, CommonError> {
        if let Some(init) = &def.init {
            match self.store.get_tool_init_state(project_id, tool_id).await? {
                Some(state) if state.initialized => {}
                Some(state) => {
                    return Ok(json!({
                        "success": false,
                        "error": state.error.unwrap_or_else(|| "tool initialization previously failed".to_string()),
                    }));
                }
                None => {
                    let empty_args = Map::new();
                    let result = self.run_spec(project_id, &init.cmd, &empty_args).await?;
                    match &result {
                        CommandOutcome::Success { .. } => {
                            self.store.record_tool_init(project_id, tool_id, true, None).await?;
                        }
                        CommandOutcome::Failure { error } => {
                            self.store
                                .record_tool_init(project_id, tool_id, false, Some(error))
                                .await?;
                            return Ok(result.into_value());
                        }
                    }
                }
            }
        }

        let outcome = self.run_spec(project_id, &def.run.cmd, arguments).await?;
        Ok(outcome.into_value())
    }

    async fn run_spec(
        &self,
        project_id: &str,
        template: &str,
        arguments: &Map<String, Value>,
    ) -> Result<CommandOutcome, CommonError> {
        let with_args = substitute_arg_placeholders(template, arguments)?;

        let vars = self.store.list_variables(project_id).await?;
        let (substituted, unresolved) = substitute_variables(&Value::String(with_args), &vars);
        if unresolved {
            return Err(CommonError::InvalidRequest {
                    msg: format!("command for project '{project_id}' has unresolved variables"),
                    source: None,
            });
        }
        let command = substituted.as_str().unwrap_or_default().to_string();

        Ok(run_shell(&command).await)
    }
}

enum CommandOutcome {
    Success { stdout: String, stderr: String },
    Failure { error: String },
}

impl CommandOutcome {
    fn into_value(self) -> Value {
        match self {
            CommandOutcome::Success { stdout, stderr } => {
                let result = if stdout.trim().is_empty() { stderr } else { stdout };
                json!({ "success": true, "result": result })
            }
            CommandOutcome::Failure { error } => {
                json!({ "success": false, "error": error })
            }
        }
    }
}

async fn run_shell(command: &str) -> CommandOutcome {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(COMMAND_TIMEOUT, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return CommandOutcome::Failure {
                error: format!("failed to run command: {e}"),
            };
        }
        Err(_) => {
            return CommandOutcome::Failure {
                error: format!("command timed out after {}s", COMMAND_TIMEOUT.as_secs()),
            };
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        CommandOutcome::Success { stdout, stderr }
    } else {
        let error = if stderr.trim().is_empty() { stdout } else { stderr };
        CommandOutcome::Failure { error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capa_shared::types::CommandSpec;
    use capa_store::connection::establish_in_memory_connection;
    use capa_store::repository::{ProjectRepositoryLike, Repository};

    async fn executor() -> (Executor<Repository>, String) {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Arc::new(Repository::new(conn));
        let project = repo.get_or_create_project("p1", "/tmp/p1").await.unwrap();
        (Executor::new(repo), project.id)
    }

    #[tokio::test]
    async fn runs_a_simple_command_and_captures_stdout() {
        let (executor, project_id) = executor().await;
        let def = CommandToolDef {
            init: None,
            run: CommandSpec {
                cmd: "echo hello".to_string(),
                args: vec![],
            },
        };
        let result = executor
            .run_command_tool(&project_id, "t1", &def, &Map::new())
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["result"], "hello\n");
    }

    #[tokio::test]
    async fn substitutes_call_arguments() {
        let (executor, project_id) = executor().await;
        let def = CommandToolDef {
            init: None,
            run: CommandSpec {
                cmd: "echo {name}".to_string(),
                args: vec![],
            },
        };
        let mut arguments = Map::new();
        arguments.insert("name".to_string(), json!("world"));
        let result = executor
            .run_command_tool(&project_id, "t1", &def, &arguments)
            .await
            .unwrap();
        assert_eq!(result["result"], "world\n");
    }

    #[tokio::test]
    async fn missing_required_argument_is_an_error() {
        let (executor, project_id) = executor().await;
        let def = CommandToolDef {
            init: None,
            run: CommandSpec {
                cmd: "echo {name}".to_string(),
                args: vec![],
            },
        };
        let err = executor
            .run_command_tool(&project_id, "t1", &def, &Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid request"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_result_not_an_error() {
        let (executor, project_id) = executor().await;
        let def = CommandToolDef {
            init: None,
            run: CommandSpec {
                cmd: "exit 1".to_string(),
                args: vec![],
            },
        };
        let result = executor
            .run_command_tool(&project_id, "t1", &def, &Map::new())
            .await
            .unwrap();
        assert_eq!(result["success"], false);
    }

    #[tokio::test]
    async fn init_runs_once_and_then_short_circuits_on_failure() {
        let (executor, project_id) = executor().await;
        let def = CommandToolDef {
            init: Some(CommandSpec {
                cmd: "exit 1".to_string(),
                args: vec![],
            }),
            run: CommandSpec {
                cmd: "echo never".to_string(),
                args: vec![],
            },
        };
        let first = executor
            .run_command_tool(&project_id, "t1", &def, &Map::new())
            .await
            .unwrap();
        assert_eq!(first["success"], false);

        let second = executor
            .run_command_tool(&project_id, "t1", &def, &Map::new())
            .await
            .unwrap();
        assert_eq!(second["success"], false);
    }
}
