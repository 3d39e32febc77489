mod version;

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use buyruk_core::config::{self, OutputFormat, CONFIG_KEYS};
use buyruk_core::context::StoreContext;
use buyruk_core::epics::{self, EpicPatch, NewEpic};
use buyruk_core::exchange;
use buyruk_core::issues::{self, IssueFilter, IssuePatch, NewIssue};
use buyruk_core::models::{parse_issue_id, Epic, Issue, IssueType, Priority, Status};
use buyruk_core::project;
use buyruk_render::{renderer_for, Renderer};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "BUYRUK_LOG";

#[derive(Parser)]
#[command(name = "buyruk", version = version::FULL, about = "Local-first issue tracker")]
struct Cli {
    /// Store directory (defaults to BUYRUK_HOME, then the user config directory)
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,
    /// Project key (defaults to the configured default_project)
    #[arg(long, short = 'p', global = true, value_name = "KEY")]
    project: Option<String>,
    /// Output format: modern, json, or csv
    #[arg(long, short = 'f', global = true, value_name = "FORMAT")]
    format: Option<String>,
    /// Log debug output to stderr
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information
    Version,
    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommand,
    },
    /// Manage issues
    Issue {
        #[command(subcommand)]
        command: IssueCommand,
    },
    /// Manage epics
    Epic {
        #[command(subcommand)]
        command: EpicCommand,
    },
    /// List issues of the current project
    List {
        #[arg(long)]
        status: Option<Status>,
        #[arg(long, value_name = "EPIC_ID")]
        epic: Option<String>,
    },
    /// Show one issue
    View { id: String },
    /// Read or change settings
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Export a project to a portable JSON file
    Export {
        /// Project key (defaults to --project or default_project)
        key: Option<String>,
        /// Output file (default: <KEY>.json)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Import a project from an export file
    Import {
        file: PathBuf,
        /// Replace an existing project with the same key
        #[arg(long)]
        overwrite: bool,
    },
}

#[derive(Subcommand)]
enum ProjectCommand {
    Create {
        key: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Rebuild the project index from the issue files
    Repair { key: String },
    Delete {
        key: String,
        /// Skip the confirmation and override a pending transaction or a held lock
        #[arg(long, short = 'y')]
        yes: bool,
    },
    List,
}

#[derive(Subcommand)]
enum IssueCommand {
    Create {
        #[arg(long)]
        title: String,
        /// Explicit id (default: next sequence)
        #[arg(long)]
        id: Option<String>,
        #[arg(long = "type", value_name = "TYPE")]
        issue_type: Option<IssueType>,
        #[arg(long)]
        status: Option<Status>,
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_name = "EPIC_ID")]
        epic: Option<String>,
    },
    View { id: String },
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long = "type", value_name = "TYPE")]
        issue_type: Option<IssueType>,
        #[arg(long)]
        status: Option<Status>,
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long)]
        description: Option<String>,
        /// Epic id; an empty value detaches the issue
        #[arg(long, value_name = "EPIC_ID")]
        epic: Option<String>,
    },
    /// Mark an issue as blocked by another
    Link {
        id: String,
        dependency: String,
        #[arg(long)]
        remove: bool,
    },
    /// Attach a pull request URL
    Pr {
        id: String,
        url: String,
        #[arg(long)]
        remove: bool,
    },
    Delete {
        id: String,
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum EpicCommand {
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        status: Option<Status>,
        #[arg(long)]
        description: Option<String>,
    },
    View { id: String },
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        status: Option<Status>,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    Delete {
        id: String,
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Get { key: String },
    /// Set a key; an empty value clears it
    Set { key: String, value: String },
    List,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .without_time()
        .try_init();
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} (yes/no): ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

struct App {
    ctx: StoreContext,
    project: Option<String>,
    format: Option<String>,
}

impl App {
    /// Resolves the project for a project-scoped command and surfaces an
    /// interrupted write left behind in it.
    fn project_key(&self) -> Result<String> {
        let key = config::resolve_project(&self.ctx, self.project.as_deref())?;
        self.check_pending(&key);
        Ok(key)
    }

    fn issue_project(&self, issue_id: &str) -> Result<String> {
        let (key, _) = parse_issue_id(issue_id)?;
        self.check_pending(&key);
        Ok(key)
    }

    fn check_pending(&self, key: &str) {
        if let Err(err) = project::startup_check(&self.ctx, key) {
            tracing::debug!(project = key, error = %err, "startup check failed");
        }
    }

    fn format(&self) -> Result<OutputFormat> {
        Ok(config::resolve_format(&self.ctx, self.format.as_deref())?)
    }

    fn renderer(&self) -> Result<Box<dyn Renderer>> {
        Ok(renderer_for(self.format()?))
    }

    fn emit_issue(&self, verb: &str, issue: &Issue) -> Result<()> {
        match self.format()? {
            OutputFormat::Modern => println!("{verb} issue {}", issue.id),
            format => renderer_for(format).render_issue(issue, &mut io::stdout().lock())?,
        }
        Ok(())
    }

    fn emit_epic(&self, verb: &str, epic: &Epic) -> Result<()> {
        match self.format()? {
            OutputFormat::Modern => println!("{verb} epic {}", epic.id),
            format => renderer_for(format).render_epic(epic, &[], &mut io::stdout().lock())?,
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };
    if let Command::Version = command {
        println!("buyruk {}", version::FULL);
        return Ok(());
    }

    let ctx = StoreContext::from_env(cli.home.as_deref())
        .context("failed to resolve the buyruk home directory")?;
    let app = App {
        ctx,
        project: cli.project,
        format: cli.format,
    };

    match command {
        Command::Version => {}
        Command::Project { command } => run_project(&app, command)?,
        Command::Issue { command } => run_issue(&app, command)?,
        Command::Epic { command } => run_epic(&app, command)?,
        Command::List { status, epic } => {
            let key = app.project_key()?;
            let filter = IssueFilter {
                status,
                epic_id: epic,
            };
            let listing = issues::list_issues(&app.ctx, &key, &filter)
                .with_context(|| format!("failed to list issues of project {key}"))?;
            for warning in &listing.warnings {
                eprintln!("warning: failed to load issue {warning}");
            }
            app.renderer()?
                .render_issues(&listing.issues, &mut io::stdout().lock())?;
        }
        Command::View { id } => view_issue(&app, &id)?,
        Command::Config { command } => run_config(&app, command)?,
        Command::Export { key, output } => {
            let key = match key {
                Some(key) => key,
                None => app.project_key()?,
            };
            let bundle = exchange::export_project(&app.ctx, &key)
                .with_context(|| format!("failed to export project {key}"))?;
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{key}.json")));
            exchange::write_bundle(&output, &bundle)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!(
                "Exported project {key} to {} ({} issues, {} epics)",
                output.display(),
                bundle.issues.len(),
                bundle.epics.len()
            );
        }
        Command::Import { file, overwrite } => {
            let bundle = exchange::read_bundle(&file)
                .with_context(|| format!("failed to read export file {}", file.display()))?;
            let summary = exchange::import_project(&app.ctx, bundle, overwrite)
                .context("failed to import project")?;
            for skipped in &summary.skipped {
                eprintln!("warning: skipped {skipped}");
            }
            println!(
                "Imported project {} ({} issues, {} epics)",
                summary.key, summary.issues, summary.epics
            );
        }
    }
    Ok(())
}

fn run_project(app: &App, command: ProjectCommand) -> Result<()> {
    let ctx = &app.ctx;
    match command {
        ProjectCommand::Create { key, name } => {
            let index = project::create_project(ctx, &key, name.as_deref())
                .with_context(|| format!("failed to create project {key}"))?;
            match app.format()? {
                OutputFormat::Modern => println!("Created project {key}"),
                format => renderer_for(format).render_project(&index, &mut io::stdout().lock())?,
            }
        }
        ProjectCommand::Repair { key } => {
            let report = project::repair_project(ctx, &key)
                .with_context(|| format!("failed to repair project {key}"))?;
            if let Some(pending) = &report.pending {
                eprintln!(
                    "note: cleared pending transaction {} from {}",
                    pending.operation, pending.timestamp
                );
            }
            for skipped in &report.skipped {
                eprintln!("warning: skipped {skipped}");
            }
            println!(
                "Repaired project {key}: {} issues indexed, {} skipped",
                report.indexed,
                report.skipped.len()
            );
        }
        ProjectCommand::Delete { key, yes } => {
            let summary = project::project_summary(ctx, &key)
                .with_context(|| format!("failed to inspect project {key}"))?;
            if summary.pending.is_some() && !yes {
                bail!(
                    "project {key} has a pending transaction; \
                     run `buyruk project repair {key}` or pass --yes to delete anyway"
                );
            }
            if !yes {
                let prompt = format!(
                    "Delete project {key} with {} issues and {} epics?",
                    summary.issues, summary.epics
                );
                if !confirm(&prompt)? {
                    bail!("deletion cancelled");
                }
            }
            project::delete_project(ctx, &key, yes)
                .with_context(|| format!("failed to delete project {key} (use --yes to force)"))?;
            println!("Deleted project {key}");
        }
        ProjectCommand::List => {
            let keys = project::list_projects(ctx).context("failed to list projects")?;
            let mut summaries = Vec::new();
            for key in keys {
                summaries.push(project::project_summary(ctx, &key)?);
            }
            match app.format()? {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
                _ if summaries.is_empty() => println!("No projects found."),
                _ => {
                    for summary in &summaries {
                        let mut line = summary.key.clone();
                        if let Some(name) = summary.name.as_deref() {
                            line.push_str(&format!(" - {name}"));
                        }
                        line.push_str(&format!(
                            " ({} issues, {} epics)",
                            summary.issues, summary.epics
                        ));
                        if summary.pending.is_some() {
                            line.push_str(" [pending transaction]");
                        }
                        if summary.index_warning.is_some() {
                            line.push_str(" [index needs repair]");
                        }
                        println!("{line}");
                    }
                }
            }
        }
    }
    Ok(())
}

fn view_issue(app: &App, id: &str) -> Result<()> {
    app.issue_project(id)?;
    let issue = issues::view_issue(&app.ctx, id)?;
    app.renderer()?
        .render_issue(&issue, &mut io::stdout().lock())?;
    Ok(())
}

fn run_issue(app: &App, command: IssueCommand) -> Result<()> {
    let ctx = &app.ctx;
    match command {
        IssueCommand::Create {
            title,
            id,
            issue_type,
            status,
            priority,
            description,
            epic,
        } => {
            let key = app.project_key()?;
            let new = NewIssue {
                title,
                id,
                issue_type: issue_type.unwrap_or_default(),
                status: status.unwrap_or_default(),
                priority,
                description,
                epic_id: epic,
            };
            let issue = issues::create_issue(ctx, &key, new)
                .with_context(|| format!("failed to create issue in project {key}"))?;
            app.emit_issue("Created", &issue)?;
        }
        IssueCommand::View { id } => view_issue(app, &id)?,
        IssueCommand::Update {
            id,
            title,
            issue_type,
            status,
            priority,
            description,
            epic,
        } => {
            app.issue_project(&id)?;
            let patch = IssuePatch {
                title,
                issue_type,
                status,
                priority,
                description,
                epic_id: epic,
            };
            if patch.is_empty() {
                bail!("nothing to update; pass at least one field flag");
            }
            let issue = issues::update_issue(ctx, &id, patch)
                .with_context(|| format!("failed to update issue {id}"))?;
            app.emit_issue("Updated", &issue)?;
        }
        IssueCommand::Link {
            id,
            dependency,
            remove,
        } => {
            app.issue_project(&id)?;
            issues::link_issue(ctx, &id, &dependency, remove)
                .with_context(|| format!("failed to link issue {id}"))?;
            if remove {
                println!("Issue {id} is no longer blocked by {dependency}");
            } else {
                println!("Issue {id} is now blocked by {dependency}");
            }
        }
        IssueCommand::Pr { id, url, remove } => {
            app.issue_project(&id)?;
            if remove {
                issues::remove_pr(ctx, &id, &url)
                    .with_context(|| format!("failed to update issue {id}"))?;
                println!("Removed PR {url} from issue {id}");
            } else {
                issues::add_pr(ctx, &id, &url)
                    .with_context(|| format!("failed to update issue {id}"))?;
                println!("Added PR {url} to issue {id}");
            }
        }
        IssueCommand::Delete { id, yes } => {
            app.issue_project(&id)?;
            issues::view_issue(ctx, &id)?;
            let dependents = match issues::find_dependents(ctx, &id) {
                Ok(dependents) => dependents,
                Err(err) => {
                    eprintln!("warning: could not check dependents of {id}: {err}");
                    Vec::new()
                }
            };
            if !dependents.is_empty() {
                eprintln!(
                    "warning: {} issue(s) depend on {id}: {}",
                    dependents.len(),
                    dependents.join(", ")
                );
            }
            if !yes && !confirm(&format!("Delete issue {id}?"))? {
                bail!("deletion cancelled");
            }
            let deleted = issues::delete_issue(ctx, &id)
                .with_context(|| format!("failed to delete issue {id}"))?;
            if let Some(warning) = deleted.index_warning {
                eprintln!("warning: failed to update project index: {warning}");
            }
            if let Some(warning) = deleted.dependents_warning {
                eprintln!("warning: dependents were not checked: {warning}");
            }
            println!("Deleted issue {id}");
        }
    }
    Ok(())
}

fn run_epic(app: &App, command: EpicCommand) -> Result<()> {
    let ctx = &app.ctx;
    let key = app.project_key()?;
    match command {
        EpicCommand::Create {
            title,
            id,
            status,
            description,
        } => {
            let new = NewEpic {
                title,
                id,
                status: status.unwrap_or_default(),
                description,
            };
            let epic = epics::create_epic(ctx, &key, new)
                .with_context(|| format!("failed to create epic in project {key}"))?;
            app.emit_epic("Created", &epic)?;
        }
        EpicCommand::View { id } => {
            let view = epics::view_epic(ctx, &key, &id)?;
            app.renderer()?
                .render_epic(&view.epic, &view.issues, &mut io::stdout().lock())?;
        }
        EpicCommand::Update {
            id,
            title,
            status,
            description,
        } => {
            if title.is_none() && status.is_none() && description.is_none() {
                bail!("nothing to update; pass at least one field flag");
            }
            let patch = EpicPatch {
                title,
                status,
                description,
            };
            let epic = epics::update_epic(ctx, &key, &id, patch)
                .with_context(|| format!("failed to update epic {id}"))?;
            app.emit_epic("Updated", &epic)?;
        }
        EpicCommand::List => {
            let listing = epics::list_epics(ctx, &key)
                .with_context(|| format!("failed to list epics of project {key}"))?;
            for warning in &listing.warnings {
                eprintln!("warning: failed to load epic {warning}");
            }
            app.renderer()?
                .render_epics(&listing.epics, &mut io::stdout().lock())?;
        }
        EpicCommand::Delete { id, yes } => {
            epics::view_epic(ctx, &key, &id)?;
            if !yes && !confirm(&format!("Delete epic {id}?"))? {
                bail!("deletion cancelled");
            }
            let deleted = epics::delete_epic(ctx, &key, &id)
                .with_context(|| format!("failed to delete epic {id}"))?;
            if !deleted.linked_issues.is_empty() {
                eprintln!(
                    "warning: {} issue(s) still reference {id}: {}",
                    deleted.linked_issues.len(),
                    deleted.linked_issues.join(", ")
                );
            }
            println!("Deleted epic {id}");
        }
    }
    Ok(())
}

fn run_config(app: &App, command: ConfigCommand) -> Result<()> {
    let ctx = &app.ctx;
    match command {
        ConfigCommand::Get { key } => match config::get_value(ctx, &key)? {
            Some(value) => println!("{value}"),
            None => eprintln!("{key} is not set"),
        },
        ConfigCommand::Set { key, value } => {
            config::set_value(ctx, &key, &value)?;
            if value.trim().is_empty() {
                println!("Cleared {key}");
            } else {
                println!("Set {key} = {}", value.trim());
            }
        }
        ConfigCommand::List => {
            for key in CONFIG_KEYS {
                let value = config::get_value(ctx, key)?;
                println!("{key} = {}", value.as_deref().unwrap_or(""));
            }
        }
    }
    Ok(())
}
