use std::env;

use pg_message_log::{create_pool, DbConfig, LogQueueConfig, MessageLog, NewMessage};
use tracing_subscriber::EnvFilter;

fn usage() {
    eprintln!("Usage:");
    eprintln!("  message-log-cli init <topic> <consumer_group> <DATABASE_URL>");
    eprintln!("  message-log-cli publish <topic> <payload> <DATABASE_URL>");
    eprintln!("  message-log-cli groups <topic> <DATABASE_URL>");
    eprintln!("  message-log-cli pending <topic> <consumer_group> <DATABASE_URL>");
    eprintln!("  message-log-cli ack <topic> <consumer_group> <offset> <DATABASE_URL>");
    eprintln!();
    eprintln!("An empty consumer_group (\"\") selects the default group.");
}

async fn connect(db_url: &str) -> Result<MessageLog, Box<dyn std::error::Error>> {
    let pool = create_pool(&DbConfig::with_url(db_url)).await?;
    Ok(MessageLog::new(pool, LogQueueConfig::from_env()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
        std::process::exit(1);
    }

    match (args[1].as_str(), args.len()) {
        ("init", 5) => {
            let log = connect(&args[4]).await?;
            let created = log.initialize_schema(&args[2], &args[3]).await?;
            println!(
                "Schema for topic {} / group {} {}",
                args[2],
                log.consumer_group(&args[3]),
                if created { "initialized" } else { "already initialized" }
            );
        }
        ("publish", 5) => {
            let log = connect(&args[4]).await?;
            let message = NewMessage::new(args[3].as_bytes());
            log.insert(&args[2], &[message.clone()]).await?;
            println!("Published message {} to {}", message.id, args[2]);
        }
        ("groups", 4) => {
            let log = connect(&args[3]).await?;
            for group in log.consumer_groups(&args[2]).await? {
                println!("{}", group);
            }
        }
        ("pending", 5) => {
            let log = connect(&args[4]).await?;
            let pending = log.pending(&args[2], &args[3]).await?;
            println!("{} unacknowledged messages", pending);
        }
        ("ack", 6) => {
            let offset: i64 = args[4].parse()?;
            let log = connect(&args[5]).await?;
            if log.acknowledge(&args[2], &args[3], offset).await? {
                println!("Acknowledged offset {}", offset);
            } else {
                println!("Offset {} was already acknowledged", offset);
            }
        }
        _ => {
            eprintln!("Invalid arguments");
            usage();
            std::process::exit(1);
        }
    }

    Ok(())
}
