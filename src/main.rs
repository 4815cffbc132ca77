use std::io::Write;
use std::sync::Arc;

use eyre::{Context, Result, bail};
use personal_agent::backend::new_backend;
use personal_agent::cancellation::CancellationRegistry;
use personal_agent::cli::{ChatCommand, Command, Commands, ProjectCommand, SendArgs, TaskCommand};
use personal_agent::config::{Configuration, init_logger, verbose};
use personal_agent::models::{Event, MessageKind};
use personal_agent::services::{ReplyOutcome, ReplyService};
use personal_agent::storage::{ArcStorage, MessageTarget, new_storage};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Command::new();
    if cmd.version() {
        cmd.print_version();
        return Ok(());
    }

    let Some(subcommand) = cmd.subcommand() else {
        return Command::print_help();
    };

    std::panic::set_hook(Box::new(|panic_info| {
        better_panic::Settings::auto().create_panic_handler()(panic_info);
    }));

    let config = cmd.get_config()?;
    init_logger(&config.log)?;
    Configuration::init(config.clone())?;
    verbose!("[+] Logger initialized");

    verbose!("[+] Initializing storage...");
    let registry = Arc::new(CancellationRegistry::new());
    let mut storage_config = config.storage.clone();
    if matches!(subcommand, Commands::Migrate) {
        // the migrate command reports the run itself
        let personal_agent::config::StorageConfig::Sqlite(sqlite) = &mut storage_config;
        sqlite.migrate_on_startup = false;
    }
    let storage = new_storage(&storage_config, registry.clone())
        .await
        .wrap_err("initializing storage")?;
    verbose!("[+] Storage initialized");

    match subcommand {
        Commands::Project(command) => project(&storage, command).await,
        Commands::Chat(command) => chat(&storage, command).await,
        Commands::History { chat } => history(&storage, *chat).await,
        Commands::Task(command) => task(&storage, command).await,
        Commands::Migrate => {
            let report = storage
                .migrate_if_needed()
                .await
                .wrap_err("migrating database")?;
            println!("{report}");
            Ok(())
        }
        Commands::Send(args) => {
            verbose!("[+] Initializing backend...");
            let backend = new_backend(&config.backend)?;
            let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
            let service = ReplyService::new(storage.clone(), backend, registry, Arc::new(event_tx))
                .with_stream(args.stream || config.general.stream);
            send(&storage, service, event_rx, args).await
        }
    }
}

async fn project(storage: &ArcStorage, command: &ProjectCommand) -> Result<()> {
    match command {
        ProjectCommand::List => {
            for project in storage.list_projects().await? {
                println!("{}\t{}", project.id(), project.name());
            }
        }
        ProjectCommand::Create { name, context } => {
            let project = storage
                .create_project(name, context.as_deref())
                .await
                .wrap_err("creating project")?;
            println!("created project {} ({})", project.name(), project.id());
        }
        ProjectCommand::Rename { name, new_name } => {
            let project = storage.find_project(name).await?;
            storage
                .rename_project(project.id(), new_name)
                .await
                .wrap_err("renaming project")?;
        }
        ProjectCommand::Context { name, text, clear } => {
            let project = storage.find_project(name).await?;
            match (text, clear) {
                (Some(text), _) => storage.set_project_context(project.id(), Some(text.as_str())).await?,
                (None, true) => storage.set_project_context(project.id(), None).await?,
                (None, false) => println!("{}", project.context().unwrap_or_default()),
            }
        }
        ProjectCommand::Delete { name } => {
            let project = storage.find_project(name).await?;
            let removed = storage
                .delete_project(project.id())
                .await
                .wrap_err("deleting project")?;
            println!(
                "deleted project {} with {} conversation(s)",
                project.name(),
                removed.len()
            );
        }
    }
    Ok(())
}

async fn chat(storage: &ArcStorage, command: &ChatCommand) -> Result<()> {
    match command {
        ChatCommand::List { project } => {
            let project_id = match project {
                Some(name) => Some(storage.find_project(name).await?.id()),
                None => None,
            };
            for conversation in storage.list_conversations(project_id).await? {
                println!(
                    "{}\t{}\t{}",
                    conversation.id(),
                    conversation.display_name(),
                    conversation.created_at().format("%Y-%m-%d %H:%M")
                );
            }
        }
        ChatCommand::Create { project, name } => {
            let project_id = match project {
                Some(name) => Some(storage.find_project(name).await?.id()),
                None => None,
            };
            let conversation = storage
                .create_conversation(project_id, name.as_deref())
                .await
                .wrap_err("creating conversation")?;
            println!("{}", conversation.id());
        }
        ChatCommand::Rename { id, name } => {
            storage.rename_conversation(*id, Some(name.as_str())).await?;
        }
        ChatCommand::Delete { id } => {
            storage.delete_conversation(*id).await?;
        }
        ChatCommand::Clear { id } => {
            let removed = storage.clear_history(*id).await?;
            println!("removed {removed} message(s)");
        }
    }
    Ok(())
}

async fn history(storage: &ArcStorage, chat: i64) -> Result<()> {
    for message in storage.list_messages(chat).await? {
        println!(
            "[{}] {}: {}",
            message.created_at().format("%Y-%m-%d %H:%M:%S"),
            message.sender(),
            message.content()
        );
    }
    Ok(())
}

async fn task(storage: &ArcStorage, command: &TaskCommand) -> Result<()> {
    match command {
        TaskCommand::Add {
            project,
            description,
        } => {
            let project = storage.find_project(project).await?;
            let task = storage.add_task(project.id(), description).await?;
            println!("{}", task.id());
        }
        TaskCommand::List { project } => {
            let project = storage.find_project(project).await?;
            for task in storage.list_tasks(project.id()).await? {
                println!("{}\t[{}]\t{}", task.id(), task.status(), task.description());
            }
        }
        TaskCommand::Status { id, status } => {
            storage.update_task_status(*id, status).await?;
        }
    }
    Ok(())
}

async fn send(
    storage: &ArcStorage,
    service: ReplyService,
    mut event_rx: mpsc::UnboundedReceiver<Event>,
    args: &SendArgs,
) -> Result<()> {
    let target = match (args.chat, &args.project) {
        (Some(chat), _) => MessageTarget::Conversation(chat),
        (None, Some(project)) => {
            MessageTarget::NewConversation(Some(storage.find_project(project).await?.id()))
        }
        (None, None) => MessageTarget::NewConversation(None),
    };
    let kind = if args.voice {
        MessageKind::Voice
    } else {
        MessageKind::Text
    };

    let pending = service
        .send(target, kind, &args.text)
        .await
        .wrap_err("sending message")?;
    drop(service);
    let conversation_id = pending.conversation_id();
    verbose!("[+] Waiting for the reply in conversation {}", conversation_id);

    let printer = tokio::spawn(async move {
        let mut printed = 0;
        while let Some(event) = event_rx.recv().await {
            if event.conversation_id() != conversation_id {
                continue;
            }
            if let Event::ReplyPartial { text, .. } = event {
                if let Some(suffix) = text.get(printed..) {
                    print!("{suffix}");
                    let _ = std::io::stdout().flush();
                    printed = text.len();
                }
            }
        }
        printed > 0
    });

    let outcome = pending.wait().await?;
    let streamed = printer.await.wrap_err("joining printer")?;
    match outcome {
        ReplyOutcome::Committed(message) if streamed => {
            println!();
            log::debug!("reply {} committed", message.id());
        }
        ReplyOutcome::Committed(message) => println!("{}", message.content()),
        ReplyOutcome::Discarded(conversation_id) => {
            bail!("the reply was dropped: conversation {conversation_id} no longer exists")
        }
    }
    Ok(())
}
