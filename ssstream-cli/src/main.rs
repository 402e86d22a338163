use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use ssstream::{BlockingStreamWriter, SessionState, StreamTransfer};
use std::path::PathBuf;
use tracing::{debug, error};
use url::Url;

mod progress;

/// Stream data of any size into a single S3 object
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[clap(flatten)]
    config: ssstream::Config,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload files, or stdin, to an S3 object
    ///
    /// Each input is written to its own stream, so `--num-streams` is ignored.  The object is the
    /// inputs concatenated in the order they're given, except that inputs smaller than the minimum
    /// S3 part size (5 MiB) are combined with each other and may not end up in that order.
    Upload {
        /// Read data from this file instead of stdin.  May be given more than once.
        #[clap(short = 'f', long = "file", value_parser, value_name = "PATH")]
        files: Vec<PathBuf>,

        /// The S3 object to write, as an `s3://bucket/key` URL
        #[clap(value_parser, value_name = "URL")]
        target: Url,
    },
}

/// Source of the data for one producer stream
#[derive(Debug)]
enum Input {
    Stdin,
    File(PathBuf),
}

impl Input {
    /// Copy all of this input into the stream, then close it.  Blocks the calling thread.
    fn copy_into(self, mut writer: BlockingStreamWriter) -> color_eyre::Result<u64> {
        let bytes = match &self {
            Self::Stdin => std::io::copy(&mut std::io::stdin().lock(), &mut writer)
                .wrap_err("Error streaming stdin")?,
            Self::File(path) => {
                let mut file = std::fs::File::open(path)
                    .wrap_err_with(|| format!("Error opening '{}'", path.display()))?;

                std::io::copy(&mut file, &mut writer)
                    .wrap_err_with(|| format!("Error streaming '{}'", path.display()))?
            }
        };

        writer.finish()?;
        debug!(input = ?self, bytes, "Input stream closed");

        Ok(bytes)
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_logging(&args.globals)?;

    match args.command {
        Command::Upload { files, target } => upload(&args.globals, files, target).await,
    }
}

fn init_logging(globals: &Globals) -> color_eyre::Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if globals.verbose {
        "debug"
    } else if globals.quiet {
        "error"
    } else {
        "info"
    };

    // `RUST_LOG` takes precedence over the command line
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("h2=warn,hyper=info,aws=info,{default_level}")))?;

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

async fn upload(globals: &Globals, files: Vec<PathBuf>, target: Url) -> color_eyre::Result<()> {
    let inputs = if files.is_empty() {
        vec![Input::Stdin]
    } else {
        files.into_iter().map(Input::File).collect()
    };

    let config = ssstream::Config {
        num_streams: inputs.len(),
        ..globals.config.clone()
    };

    let transfer = StreamTransfer::for_s3_url(&target, config).await?;
    let progress = progress::UploadProgress::start(globals, &transfer);

    let streams = transfer.begin().await?;
    let writers = streams
        .into_iter()
        .zip(inputs)
        .map(|(stream, input)| {
            let writer = stream.into_blocking_writer();
            tokio::task::spawn_blocking(move || input.copy_into(writer))
        })
        .collect::<Vec<_>>();

    let mut input_error = None;
    for result in futures::future::join_all(writers).await {
        if let Err(e) = result.map_err(color_eyre::Report::from).and_then(|result| result) {
            input_error.get_or_insert(e);
        }
    }

    if let Some(input_error) = input_error {
        progress.finish();

        if transfer.state() != SessionState::Open {
            // The upload failed on its own and cut off the inputs; that's the error to report
            if let Err(upload_error) = transfer.complete().await {
                return Err(upload_error.into());
            }
        } else if let Err(abort_error) = transfer.abort().await {
            error!(err = ?abort_error, "Failed to abort the upload after an input error");
        }

        return Err(input_error);
    }

    let result = transfer.complete().await;
    progress.finish();
    let completed = result?;

    if !globals.quiet {
        println!(
            "Uploaded {} in {} parts to s3://{}/{}",
            byte_unit::Byte::from_bytes(completed.total_bytes as u128).get_appropriate_unit(true),
            completed.parts,
            completed.bucket,
            completed.key
        );
    }

    Ok(())
}
