use clap::{Parser, Subcommand};
use comfy_table::Table;
use common::{Job, JobId, LabelRequest, Record, Request, Response};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon control socket
    #[arg(long, env = "LABELQ_SOCKET", default_value = common::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a print job
    Submit {
        /// gLabels template file name (must end with .glabels)
        #[arg(short, long)]
        template: String,
        /// JSON file holding an array of label records
        #[arg(short, long)]
        data: PathBuf,
        /// Copies per record
        #[arg(short, long, default_value_t = 1)]
        copies: u32,
        /// Wait until the job finishes
        #[arg(short, long)]
        wait: bool,
    },
    /// Get job details
    Get {
        id: String,
        /// Wait until the job finishes
        #[arg(short, long)]
        wait: bool,
    },
    /// List recent jobs
    List {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Show queue and job counters
    Stats,
    /// Print Prometheus metrics
    Metrics,
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(path: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| anyhow::anyhow!("Cannot connect to {}: {}", path.display(), e))?;
        let (reader, writer) = stream.into_split();
        Ok(Self { lines: BufReader::new(reader).lines(), writer })
    }

    async fn call(&mut self, req: &Request) -> anyhow::Result<Response> {
        self.writer.write_all(&common::ipc::encode_line(req)?).await?;
        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow::anyhow!("Daemon closed the connection"))?;
        common::ipc::decode_line(&line)
    }

    async fn wait_for(&mut self, id: &JobId) -> anyhow::Result<Option<Job>> {
        loop {
            match self.call(&Request::GetJob(id.clone())).await? {
                Response::JobDetail(Some(job)) if job.status.is_terminal() => return Ok(Some(job)),
                Response::JobDetail(Some(_)) => tokio::time::sleep(Duration::from_millis(500)).await,
                Response::JobDetail(None) => return Ok(None),
                Response::Error(e) => return Err(anyhow::anyhow!(e)),
                other => return Err(anyhow::anyhow!("Unexpected response: {:?}", other)),
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut client = Client::connect(&cli.socket).await?;

    match cli.command {
        Commands::Submit { template, data, copies, wait } => {
            let content = std::fs::read_to_string(&data)
                .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", data.display(), e))?;
            let records: Vec<Record> = serde_json::from_str(&content)?;
            let req = Request::Submit(LabelRequest { template_name: template, data: records, copies });

            match client.call(&req).await? {
                Response::Submitted(id) => {
                    println!("Submitted job {}", id);
                    if wait {
                        print_job(client.wait_for(&id).await?);
                    }
                }
                other => print_response(other),
            }
        }
        Commands::Get { id, wait } => {
            let id = JobId(id);
            if wait {
                print_job(client.wait_for(&id).await?);
            } else {
                print_response(client.call(&Request::GetJob(id)).await?);
            }
        }
        Commands::List { limit } => print_response(client.call(&Request::ListJobs { limit }).await?),
        Commands::Stats => print_response(client.call(&Request::Stats).await?),
        Commands::Metrics => print_response(client.call(&Request::Metrics).await?),
    }

    Ok(())
}

fn print_response(resp: Response) {
    match resp {
        Response::Submitted(id) => println!("Submitted job {}", id),
        Response::Error(e) => eprintln!("Error: {}", e),
        Response::JobDetail(job) => print_job(job),
        Response::JobList(jobs) => {
            let mut table = Table::new();
            table.set_header(vec!["ID", "Status", "Template", "File", "Created"]);
            for job in jobs {
                table.add_row(vec![
                    job.id.to_string(),
                    job.status.to_string(),
                    job.template,
                    job.filename,
                    job.created_at
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M:%S")
                        .to_string(),
                ]);
            }
            println!("{table}");
        }
        Response::Stats(stats) => {
            println!("Jobs submitted: {}", stats.jobs_total);
            println!("Queue depth:    {}", stats.queue_depth);
            println!("Workers:        {}", stats.max_parallel);
            println!(
                "Tracked:        {} pending, {} running, {} done, {} failed",
                stats.pending, stats.running, stats.done, stats.failed
            );
        }
        Response::Metrics(text) => print!("{}", text),
    }
}

fn print_job(job: Option<Job>) {
    let Some(job) = job else {
        println!("Job not found.");
        return;
    };
    println!("Job Details:");
    println!("  ID:       {}", job.id);
    println!("  Status:   {}", job.status);
    println!("  Template: {}", job.template);
    println!("  File:     {}", job.filename);
    if let Some(path) = &job.output_path {
        println!("  Output:   {}", path.display());
    }
    if let Some(error) = &job.error {
        println!("  Error:    {}", error);
    }
    println!("  Created:  {}", job.created_at.with_timezone(&chrono::Local));
    println!("  Updated:  {}", job.updated_at.with_timezone(&chrono::Local));
}
