use anyhow::Result;
use clap::{Parser, Subcommand};
mod cli_utils;
mod commands;

use commands::{
    DlqListOptions, EnqueueOptions, cron_check, cron_next, dlq_list, enqueue, queue_pending,
    queue_stats,
};

#[derive(Parser)]
#[command(name = "rsq")]
#[command(version)]
#[command(about = "Operate rsq streams, dead letters and cron schedules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a job event for a registered handler.
    Enqueue {
        function_name: String,
        #[arg(long)]
        config: Option<String>,
        /// Positional argument as JSON; repeatable.
        #[arg(long = "arg", action = clap::ArgAction::Append)]
        args: Vec<String>,
        /// Keyword argument as `key=<json>`; repeatable.
        #[arg(long = "kwarg", action = clap::ArgAction::Append)]
        kwargs: Vec<String>,
        #[arg(long)]
        stream: Option<String>,
    },
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    Stats {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        stream: Option<String>,
    },
    Pending {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        stream: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum DlqCommand {
    List {
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        stream: Option<String>,
        #[arg(long)]
        function: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = false)]
        raw: bool,
    },
}

#[derive(Subcommand)]
enum CronCommand {
    /// Report whether an expression matches a minute (default: now).
    Check {
        expression: String,
        #[arg(long)]
        at: Option<String>,
    },
    /// List upcoming fire times.
    Next {
        expression: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long, default_value_t = 5)]
        count: usize,
        #[arg(long, default_value_t = 24 * 7)]
        horizon_hours: i64,
    },
}

async fn dispatch_command(command: Commands) -> Result<()> {
    match command {
        Commands::Enqueue {
            function_name,
            config,
            args,
            kwargs,
            stream,
        } => {
            enqueue(EnqueueOptions {
                config,
                function_name,
                args,
                kwargs,
                stream,
            })
            .await?;
        }
        Commands::Queue { command } => match command {
            QueueCommand::Stats { config, stream } => {
                queue_stats(config, stream).await?;
            }
            QueueCommand::Pending {
                config,
                stream,
                limit,
            } => {
                queue_pending(config, stream, limit).await?;
            }
        },
        Commands::Dlq { command } => match command {
            DlqCommand::List {
                config,
                stream,
                function,
                limit,
                raw,
            } => {
                dlq_list(DlqListOptions {
                    config,
                    stream,
                    function,
                    limit,
                    raw,
                })
                .await?;
            }
        },
        Commands::Cron { command } => match command {
            CronCommand::Check { expression, at } => {
                cron_check(&expression, at.as_deref())?;
            }
            CronCommand::Next {
                expression,
                from,
                count,
                horizon_hours,
            } => {
                cron_next(&expression, from.as_deref(), count, horizon_hours)?;
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    rsq::telemetry::init_tracing();
    let cli = Cli::parse();
    dispatch_command(cli.command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_enqueue_with_repeated_arguments() {
        let cli = Cli::try_parse_from([
            "rsq",
            "enqueue",
            "mail.send",
            "--arg",
            "\"bob\"",
            "--arg",
            "3",
            "--kwarg",
            "urgent=true",
        ])
        .unwrap();
        let Commands::Enqueue {
            function_name,
            args,
            kwargs,
            ..
        } = cli.command
        else {
            panic!("expected enqueue");
        };
        assert_eq!(function_name, "mail.send");
        assert_eq!(args, vec!["\"bob\"", "3"]);
        assert_eq!(kwargs, vec!["urgent=true"]);
    }

    #[test]
    fn parses_cron_next_defaults() {
        let cli = Cli::try_parse_from(["rsq", "cron", "next", "*/5 * * * *"]).unwrap();
        let Commands::Cron {
            command:
                CronCommand::Next {
                    expression,
                    count,
                    horizon_hours,
                    from,
                },
        } = cli.command
        else {
            panic!("expected cron next");
        };
        assert_eq!(expression, "*/5 * * * *");
        assert_eq!(count, 5);
        assert_eq!(horizon_hours, 168);
        assert!(from.is_none());
    }
}
