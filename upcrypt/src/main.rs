#![warn(clippy::all, clippy::pedantic)]

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::exit;
use tokio::{fs::File, io::AsyncReadExt};
use tracing_subscriber::EnvFilter;
use upcrypt_buffer::{BufferedItem, Error, ItemFactory, ItemRecord, DEFAULT_SIZE_THRESHOLD};

/// Buffers files the way an upload server would: in memory while
/// small, encrypted in a temporary file once they grow.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bytes kept in memory before content moves to an encrypted file
    #[arg(short, long, env = "UPCRYPT_THRESHOLD", default_value_t = DEFAULT_SIZE_THRESHOLD)]
    threshold: usize,

    /// Directory for encrypted files [default: system temp directory]
    #[arg(short, long, env = "UPCRYPT_REPOSITORY")]
    repository: Option<PathBuf>,

    #[command(subcommand)]
    operation: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Buffer a file, then write its plaintext to OUTPUT
    Store { input: PathBuf, output: PathBuf },

    /// Buffer a file and save it as a record. The record holds the key!
    Persist { input: PathBuf, record: PathBuf },

    /// Restore a record and write its plaintext to OUTPUT
    Restore { record: PathBuf, output: PathBuf },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let factory = ItemFactory::new(cli.threshold, cli.repository);

    let result = match cli.operation {
        Commands::Store { input, output } => store(&factory, &input, &output).await,
        Commands::Persist { input, record } => persist(&factory, &input, &record).await,
        Commands::Restore { record, output } => restore(&record, &output).await,
    };

    result.unwrap_or_else(|err| {
        eprintln!("{err}");
        exit(1)
    });
}

async fn store(factory: &ItemFactory, input: &Path, output: &Path) -> Result<(), Error> {
    let mut item = buffer_file(factory, input).await?;
    print_summary(&item);

    item.write_to(output).await?;
    item.delete().await
}

async fn persist(factory: &ItemFactory, input: &Path, record_path: &Path) -> Result<(), Error> {
    let item = buffer_file(factory, input).await?;
    print_summary(&item);

    let record = item.into_record().await?;
    tokio::fs::write(record_path, record.to_bytes()?).await?;
    println!("Saved record to {}", record_path.display());
    Ok(())
}

async fn restore(record_path: &Path, output: &Path) -> Result<(), Error> {
    let record = ItemRecord::from_bytes(&tokio::fs::read(record_path).await?)?;
    let mut item = BufferedItem::restore(record).await?;
    tokio::fs::remove_file(record_path).await?;
    print_summary(&item);

    item.write_to(output).await?;
    item.delete().await
}

/// Streams `input` into a new item.
async fn buffer_file(factory: &ItemFactory, input: &Path) -> Result<BufferedItem, Error> {
    let mut file = File::open(input).await?;
    let size = file.metadata().await?.len();
    let file_name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    let mut item = factory.create_item(Some("file".to_string()), None, false, file_name);
    let progress = create_progress_bar(size);

    let mut sink = item.write_sink();
    let mut buf = vec![0; 10_000];
    loop {
        let bytes_read = file.read(&mut buf).await?;
        if bytes_read == 0 {
            break;
        }
        sink.write(&buf[..bytes_read]).await?;

        progress.inc(bytes_read as u64);
    }
    sink.close().await?;
    progress.finish_and_clear();

    Ok(item)
}

fn print_summary(item: &BufferedItem) {
    let residency = if item.is_in_memory() {
        "in memory"
    } else {
        "encrypted on disk"
    };
    println!("{residency}: {item}");
}

fn create_progress_bar(bytes: u64) -> ProgressBar {
    let style = ProgressStyle::with_template(
        "[{wide_bar}] {bytes}/{total_bytes} | {bytes_per_sec} | time left: {eta}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    let draw = ProgressDrawTarget::stderr_with_hz(2);
    ProgressBar::with_draw_target(Some(bytes), draw).with_style(style)
}
