use certpeek::config::{Config, ConfigError};
use certpeek::report::{self, OutputFormat, RenderOptions};
use certpeek::{InspectOptions, Inspection};
use clap::{ArgAction, Parser};
use log::{debug, info};
use std::path::PathBuf;
use std::process::exit;

mod refresh;

const CONFIG_EXIT_CODE: i32 = 78;

#[derive(Parser, Debug)]
#[command(name = "certpeek", version, about, long_about = None)]
struct Cli {
    /// Host to inspect: host, host:port, [ipv6]:port or scheme://host[:port]
    #[arg(required_unless_present_any = ["refresh_logs", "generate_config"])]
    host: Option<String>,

    /// HTTP proxy to tunnel through (http://host[:port])
    #[arg(long, env = "https_proxy")]
    proxy: Option<String>,

    /// SNI name to send instead of the host
    #[arg(long, conflicts_with = "no_servername")]
    servername: Option<String>,

    /// Do not send SNI
    #[arg(long)]
    no_servername: bool,

    /// Only show the leaf certificate
    #[arg(long)]
    first_only: bool,

    /// Print each certificate in PEM format
    #[arg(long)]
    print_pem: bool,

    /// Print OpenSSL's text dump of each certificate
    #[arg(long)]
    print_text: bool,

    /// Output format
    #[arg(long, value_enum)]
    output: Option<OutputFormat>,

    /// Shorthand for --output json
    #[arg(long, conflicts_with = "output")]
    json: bool,

    /// Network timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Configuration file (defaults to ./certpeek.toml when present)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print an example configuration file and exit
    #[arg(long)]
    generate_config: bool,

    /// Download the public CT log list into FILE and exit
    #[arg(long, value_name = "FILE")]
    refresh_logs: Option<PathBuf>,

    /// More output on stderr (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Only flags that were actually given end up set, so they override
    /// the file without erasing it.
    fn to_config(&self) -> Config {
        let output = if self.json {
            Some(OutputFormat::Json)
        } else {
            self.output
        };
        Config {
            proxy: self.proxy.clone(),
            servername: self.servername.clone(),
            no_servername: self.no_servername.then_some(true),
            first_only: self.first_only.then_some(true),
            output,
            print_pem: self.print_pem.then_some(true),
            print_text: self.print_text.then_some(true),
            timeout_secs: self.timeout,
            ..Config::default()
        }
    }
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, level),
    );
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let file = Config::load(cli.config.as_deref())?;
    let config = Config::defaults().merge_with(file).merge_with(cli.to_config());
    config.validate()?;
    Ok(config)
}

fn fail_config(err: ConfigError) -> ! {
    eprintln!("{}", err);
    exit(CONFIG_EXIT_CODE);
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    if cli.generate_config {
        println!("{}", Config::example_toml());
        exit(0);
    }

    let config = load_config(&cli).unwrap_or_else(|e| fail_config(e));
    debug!("effective configuration: {:?}", config);
    let registries = config.registries().unwrap_or_else(|e| fail_config(e));

    if let Some(path) = &cli.refresh_logs {
        match refresh::gstatic::refresh_known_logs(path, &registries.logs, config.timeout()) {
            Ok(count) => {
                info!("Wrote {} logs to {}", count, path.display());
                exit(0);
            }
            Err(e) => {
                eprintln!("{}", e);
                exit(1);
            }
        }
    }

    let Some(host) = cli.host.as_deref() else {
        eprintln!("A host to inspect is required");
        exit(64);
    };

    let options = InspectOptions {
        proxy: config.proxy.clone(),
        servername: config.servername.clone(),
        no_servername: config.no_servername.unwrap_or(false),
        first_only: config.first_only.unwrap_or(false),
        timeout: config.timeout(),
    };
    let render_options = RenderOptions {
        print_pem: config.print_pem.unwrap_or(false),
        print_text: config.print_text.unwrap_or(false),
    };

    let inspection = match Inspection::from(host, &options, &registries) {
        Ok(inspection) => inspection,
        Err(err) => {
            eprintln!("Fail to check host: {}  {}", host, err);
            exit(err.exit_code());
        }
    };

    let rendered = match config.output.unwrap_or(OutputFormat::Text) {
        OutputFormat::Text => report::render_text(
            &inspection.report,
            &inspection.chain,
            render_options,
        )
        .map_err(|e| e.to_string()),
        OutputFormat::Json => report::render_json(
            &inspection.host,
            inspection.handshake_error.as_deref(),
            &inspection.report,
            &inspection.chain,
            render_options,
        )
        .map_err(|e| e.to_string()),
    };

    match rendered {
        Ok(output) => print!("{}", output),
        Err(e) => {
            eprintln!("Failed to render report: {}", e);
            exit(70);
        }
    }
    exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_unset_flags_do_not_override_file() {
        let cli = Cli::try_parse_from(["certpeek", "example.com"]).unwrap();
        let file = Config {
            first_only: Some(true),
            output: Some(OutputFormat::Json),
            ..Config::default()
        };
        let merged = Config::defaults().merge_with(file).merge_with(cli.to_config());
        assert_eq!(merged.first_only, Some(true));
        assert_eq!(merged.output, Some(OutputFormat::Json));
    }

    #[test]
    fn test_json_flag_selects_json_output() {
        let cli = Cli::try_parse_from(["certpeek", "--json", "example.com"]).unwrap();
        assert_eq!(cli.to_config().output, Some(OutputFormat::Json));
    }

    #[test]
    fn test_servername_conflicts_with_no_servername() {
        let result = Cli::try_parse_from([
            "certpeek",
            "--servername",
            "a.example",
            "--no-servername",
            "example.com",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_host_optional_for_maintenance_commands() {
        assert!(Cli::try_parse_from(["certpeek", "--generate-config"]).is_ok());
        assert!(Cli::try_parse_from(["certpeek", "--refresh-logs", "logs.toml"]).is_ok());
        assert!(Cli::try_parse_from(["certpeek"]).is_err());
    }
}
