use std::path::PathBuf;

use clap::Parser;

use shardcopy_cluster::statement::{CopyOption, CopyRequest};
use shardcopy_common::types::QualifiedName;

use crate::csv::{parse_delimiter, CsvOptions, RowFormat};

#[derive(Parser, Debug)]
#[command(
    name = "shardcopy",
    about = "Bulk-load delimited rows into a sharded, replicated PostgreSQL table",
    version
)]
pub struct Cli {
    /// Path to the TOML config describing tables, shards and replicas.
    #[arg(short, long, env = "SHARDCOPY_CONFIG", default_value = "shardcopy.toml")]
    pub config: String,

    /// Target table, optionally schema-qualified.
    #[arg(short, long, required_unless_present = "print_default_config")]
    pub table: Option<String>,

    /// Copied columns, comma separated. Defaults to every table column.
    #[arg(long, value_delimiter = ',')]
    pub columns: Vec<String>,

    /// Input file. Reads stdin when omitted.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Input format.
    #[arg(long, value_enum, default_value_t = RowFormat::Text)]
    pub format: RowFormat,

    /// Field delimiter. Defaults to tab for text and ',' for csv.
    #[arg(long)]
    pub delimiter: Option<String>,

    /// NULL marker. Defaults to \N for text and an unquoted empty field for csv.
    #[arg(long)]
    pub null: Option<String>,

    /// First input line is a header and is skipped.
    #[arg(long)]
    pub header: bool,

    /// CSV quote character.
    #[arg(long)]
    pub quote: Option<String>,

    /// CSV escape character. Defaults to the quote character.
    #[arg(long)]
    pub escape: Option<String>,

    /// Prometheus listen address, e.g. 0.0.0.0:9187.
    #[arg(long)]
    pub metrics_addr: Option<String>,

    /// Route and stream against an in-process cluster instead of the
    /// configured replicas. Nothing is written anywhere.
    #[arg(long)]
    pub dry_run: bool,

    /// Print the distributed query that exports the table instead of loading.
    #[arg(long)]
    pub export: bool,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    pub print_default_config: bool,
}

impl Cli {
    fn single_char(name: &str, value: &Option<String>) -> anyhow::Result<Option<u8>> {
        match value {
            None => Ok(None),
            Some(v) => parse_delimiter(v)
                .map(Some)
                .ok_or_else(|| anyhow::anyhow!("{} must be a single ASCII character, got '{}'", name, v)),
        }
    }

    /// Decoding options for the input stream.
    pub fn row_options(&self) -> anyhow::Result<CsvOptions> {
        let mut opts = CsvOptions::for_format(self.format);
        if let Some(d) = Self::single_char("--delimiter", &self.delimiter)? {
            opts.delimiter = d;
        }
        if let Some(null) = &self.null {
            opts.null_as = null.clone();
        }
        if self.format == RowFormat::Csv {
            if let Some(q) = Self::single_char("--quote", &self.quote)? {
                opts.quote = q;
                opts.escape = q;
            }
            if let Some(e) = Self::single_char("--escape", &self.escape)? {
                opts.escape = e;
            }
        } else if self.quote.is_some() || self.escape.is_some() {
            anyhow::bail!("--quote and --escape are only valid with --format csv");
        }
        opts.header = self.header;
        Ok(opts)
    }

    /// The COPY request matching the input options. Shards receive the raw
    /// lines, so every option that affects decoding is forwarded.
    pub fn copy_request(&self, opts: &CsvOptions) -> anyhow::Result<CopyRequest> {
        let table = self
            .table
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--table is required"))?;
        let defaults = CsvOptions::for_format(opts.format);

        let mut request = CopyRequest::new(QualifiedName::parse(table))
            .with_columns(self.columns.iter().map(|c| c.trim().to_string()))
            .with_option(CopyOption::new("format", opts.format.as_option()));
        if opts.delimiter != defaults.delimiter {
            request = request.with_option(CopyOption::new(
                "delimiter",
                (opts.delimiter as char).to_string(),
            ));
        }
        if opts.null_as != defaults.null_as {
            request = request.with_option(CopyOption::new("null", opts.null_as.clone()));
        }
        if opts.format == RowFormat::Csv {
            if opts.quote != defaults.quote {
                request = request.with_option(CopyOption::new("quote", (opts.quote as char).to_string()));
            }
            if opts.escape != opts.quote {
                request =
                    request.with_option(CopyOption::new("escape", (opts.escape as char).to_string()));
            }
        }
        if opts.header {
            request = request.with_option(CopyOption::flag("header"));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("shardcopy").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--table", "events"]);
        assert_eq!(cli.config, "shardcopy.toml");
        assert_eq!(cli.format, RowFormat::Text);
        assert!(cli.columns.is_empty());
        let opts = cli.row_options().unwrap();
        assert_eq!(opts.delimiter, b'\t');
        assert_eq!(opts.null_as, "\\N");

        let request = cli.copy_request(&opts).unwrap();
        assert_eq!(request.table.name, "events");
        assert_eq!(request.option("format"), Some("text"));
        assert_eq!(request.option("delimiter"), None);
        assert!(!request.is_csv());
    }

    #[test]
    fn test_table_required() {
        let err = Cli::try_parse_from(["shardcopy"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
        assert!(Cli::try_parse_from(["shardcopy", "--print-default-config"]).is_ok());
    }

    #[test]
    fn test_csv_options_forwarded() {
        let cli = parse(&[
            "-t",
            "app.events",
            "--columns",
            "id, payload",
            "--format",
            "csv",
            "--delimiter",
            ";",
            "--header",
            "--null",
            "NA",
        ]);
        let opts = cli.row_options().unwrap();
        assert_eq!(opts.delimiter, b';');
        assert!(opts.header);

        let request = cli.copy_request(&opts).unwrap();
        assert_eq!(request.table.schema.as_deref(), Some("app"));
        assert_eq!(request.columns, vec!["id".to_string(), "payload".to_string()]);
        assert!(request.is_csv());
        assert_eq!(request.option("delimiter"), Some(";"));
        assert_eq!(request.option("null"), Some("NA"));
        assert_eq!(request.option("header"), Some(""));
        assert_eq!(request.option("escape"), None);
    }

    #[test]
    fn test_quote_rejected_for_text() {
        let cli = parse(&["-t", "events", "--quote", "'"]);
        assert!(cli.row_options().is_err());
    }

    #[test]
    fn test_bad_delimiter() {
        let cli = parse(&["-t", "events", "--delimiter", "ab"]);
        assert!(cli.row_options().is_err());
    }
}
