use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use quiver::{
    Client, ClientConfig, Metadata, QueryRequest, Record, RecordBatch, RecordFilter, Vector, DEFAULT_DATABASE,
    DEFAULT_TENANT,
};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// An embeddable vector database
#[derive(Parser, Debug)]
#[command(name = "quiver")]
#[command(about = "Inspect and load a quiver data directory", long_about = None)]
struct Args {
    /// Path to the data directory
    #[arg(short, long, default_value = "./data")]
    persist_path: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of collection indices kept in memory
    #[arg(long, default_value_t = 100)]
    cache_size: usize,

    #[arg(long, default_value = DEFAULT_TENANT)]
    tenant: String,

    #[arg(long, default_value = DEFAULT_DATABASE)]
    database: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a collection (or open it if it exists)
    CreateCollection {
        name: String,
        /// Collection configuration as JSON
        #[arg(long)]
        config: Option<String>,
    },
    /// Add records from a JSON Lines file
    Add {
        collection: String,
        /// One `{"id", "embedding", "metadata"?, "document"?}` object per line
        #[arg(long)]
        file: PathBuf,
        /// Records written per batch
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
    },
    /// Nearest neighbours of an embedding
    Query {
        collection: String,
        /// Comma-separated components, e.g. `1,0,0`
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        embedding: Vec<f32>,
        #[arg(short, default_value_t = 10)]
        k: usize,
        #[arg(long = "where")]
        where_filter: Option<String>,
        #[arg(long)]
        where_document: Option<String>,
    },
    /// Number of records in a collection
    Count { collection: String },
    /// Collection names in the database
    List,
    /// Nanoseconds since the epoch, as seen by the client
    Heartbeat,
}

#[derive(Deserialize)]
struct JsonRecord {
    id: String,
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    document: Option<String>,
}

impl From<JsonRecord> for Record {
    fn from(r: JsonRecord) -> Self {
        Record {
            id: r.id,
            embedding: Vector::new(r.embedding),
            metadata: r.metadata,
            document: r.document,
        }
    }
}

fn load_records(
    client: &Client,
    collection: &quiver::Collection,
    file: &Path,
    batch_size: usize,
) -> anyhow::Result<usize> {
    if batch_size == 0 {
        bail!("--batch-size must be positive");
    }
    let reader = BufReader::new(File::open(file).with_context(|| format!("opening {}", file.display()))?);
    let mut pending = Vec::with_capacity(batch_size);
    let mut written = 0;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: JsonRecord =
            serde_json::from_str(&line).with_context(|| format!("{}:{}", file.display(), line_no + 1))?;
        pending.push(Record::from(record));
        if pending.len() == batch_size {
            written += pending.len();
            client.add(collection, RecordBatch::from_records(std::mem::take(&mut pending)))?;
        }
    }
    if !pending.is_empty() {
        written += pending.len();
        client.add(collection, RecordBatch::from_records(pending))?;
    }
    Ok(written)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting quiver v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", args.persist_path);

    let config = ClientConfig::persistent(&args.persist_path).with_cache_size(args.cache_size);
    let client = Client::new(config)?;
    let (tenant, database) = (args.tenant.as_str(), args.database.as_str());

    match args.command {
        Command::CreateCollection { name, config } => {
            let config = config
                .as_deref()
                .map(|json| quiver::CollectionConfig::resolve(Some(json), None))
                .transpose()?;
            let collection = client.create_collection(&name, config, None, true, tenant, database)?;
            println!("{}", collection.id);
        }
        Command::Add {
            collection,
            file,
            batch_size,
        } => {
            let collection = client.get_collection(&collection, tenant, database)?;
            let written = load_records(&client, &collection, &file, batch_size)?;
            info!("Added {} records to {}", written, collection.name);
            println!("{}", written);
        }
        Command::Query {
            collection,
            embedding,
            k,
            where_filter,
            where_document,
        } => {
            let collection = client.get_collection(&collection, tenant, database)?;
            let filter = RecordFilter::parse(where_filter.as_deref(), where_document.as_deref())?;
            let request = QueryRequest::new(embedding, k).with_filter(filter);
            let result = client.query(&collection, &request)?;
            let distances = result.distances.unwrap_or_default();
            for (id, distance) in result.ids.iter().zip(distances) {
                println!("{}\t{}", id, distance);
            }
        }
        Command::Count { collection } => {
            let collection = client.get_collection(&collection, tenant, database)?;
            println!("{}", client.count(&collection)?);
        }
        Command::List => {
            for collection in client.list_collections(tenant, database)? {
                println!("{}", collection.name);
            }
        }
        Command::Heartbeat => println!("{}", client.heartbeat()?),
    }

    Ok(())
}
