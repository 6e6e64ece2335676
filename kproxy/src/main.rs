#![allow(clippy::print_stderr)]

use anyhow::Context as _;
use camino::Utf8PathBuf;
use kproxy::config::ConfHandle;

const DEFAULT_CONFIG_PATH: &str = "/etc/kproxy/config.yaml";
const START_FAILED_ERR_CODE: i32 = 1;

fn main() -> std::process::ExitCode {
    match run() {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("kproxy failed to start: {error:#}");
            std::process::ExitCode::from(START_FAILED_ERR_CODE as u8)
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config_path = parse_config_path(std::env::args().skip(1))?;

    let conf_handle = ConfHandle::load(&config_path, None).context("unable to load configuration")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    rt.block_on(kproxy::run(conf_handle))
}

/// `--config-path <PATH>`, falling back to `KPROXY_CONFIG_PATH` then [`DEFAULT_CONFIG_PATH`].
fn parse_config_path(mut args: impl Iterator<Item = String>) -> anyhow::Result<Utf8PathBuf> {
    while let Some(arg) = args.next() {
        if arg == "--config-path" {
            let path = args.next().context("missing value for --config-path")?;
            return Utf8PathBuf::from_path_buf(path.into())
                .map_err(|path| anyhow::anyhow!("config path {path:?} is not valid UTF-8"));
        }

        anyhow::bail!("unrecognized argument: {arg}");
    }

    if let Ok(path) = std::env::var("KPROXY_CONFIG_PATH") {
        return Ok(Utf8PathBuf::from(path));
    }

    Ok(Utf8PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_falls_back_to_default_path() {
        let path = parse_config_path(std::iter::empty()).unwrap();
        assert_eq!(path, Utf8PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn explicit_config_path_is_used() {
        let args = ["--config-path".to_owned(), "/tmp/kproxy.yaml".to_owned()];
        let path = parse_config_path(args.into_iter()).unwrap();
        assert_eq!(path, Utf8PathBuf::from("/tmp/kproxy.yaml"));
    }

    #[test]
    fn missing_config_path_value_is_rejected() {
        let args = ["--config-path".to_owned()];
        assert!(parse_config_path(args.into_iter()).is_err());
    }
}
