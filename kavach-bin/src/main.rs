use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Error;

use kavach::archive::format_single_line_entry;
use kavach::{error_class, ErrorClass, KavachContext, PackOptions, UnpackOptions};
use kavach_format::CipherKind;

use proxmox_router::cli::*;
use proxmox_schema::api;

/// Placeholder for the section header slot describing an appended archive.
///
/// Only the slot matters, its contents are never read. Packing points the
/// slot at the archive body of the new executable.
#[used]
#[link_section = ".kavach"]
static KAVACH_SECTION: [u8; 8] = *b"kavach\0\0";

/// A failed pack, unpack or list run, as opposed to a command line error.
#[derive(thiserror::Error, Debug)]
#[error("{command} failed")]
struct CommandFailed {
    command: &'static str,
    class: ErrorClass,
}

fn command_failed(command: &'static str, err: Error) -> Error {
    log::error!("{:#}", err);
    CommandFailed {
        command,
        class: error_class(&err),
    }
    .into()
}

#[api(
    input: {
        properties: {
            target: {
                description: "File or directory to pack.",
            },
            output: {
                description: "Name of the generated executable, '.kgs' is appended.",
                optional: true,
            },
            encrypt: {
                description: "Payload encryption, 'xor' or 'none'.",
                optional: true,
            },
            key: {
                description: "Encryption key.",
                optional: true,
            },
            "destroy-relics": {
                description: "Remove the target after packing it.",
                optional: true,
                default: false,
            },
        },
    },
)]
/// Pack a file or directory into a self extracting executable.
fn pack(
    target: String,
    output: Option<String>,
    encrypt: Option<String>,
    key: Option<String>,
    destroy_relics: bool,
) -> Result<(), Error> {
    let mut options = PackOptions::new(&target);
    if let Some(output) = output {
        options.output = PathBuf::from(output);
    }
    if let Some(encrypt) = encrypt {
        options.cipher = encrypt.parse::<CipherKind>()?;
    }
    options.key = key;
    options.destroy_relics = destroy_relics;

    let path = KavachContext::current()
        .and_then(|ctx| kavach::pack(&ctx, &options))
        .map_err(|err| command_failed("pack", err))?;
    log::debug!("pack finished: {:?}", path);

    Ok(())
}

#[api(
    input: {
        properties: {
            key: {
                description: "Decryption key.",
                optional: true,
            },
            "target-dir": {
                description: "Directory to create the extraction directory in.",
                optional: true,
            },
        },
    },
)]
/// Extract the archive carried by this executable.
fn unpack(key: Option<String>, target_dir: Option<String>) -> Result<(), Error> {
    let options = UnpackOptions {
        key,
        target_dir: target_dir.map(PathBuf::from),
    };

    let dest = KavachContext::current()
        .and_then(|ctx| kavach::unpack(&ctx, &options))
        .map_err(|err| command_failed("unpack", err))?;
    log::debug!("unpack finished: {:?}", dest);

    Ok(())
}

#[api(
    input: {
        properties: {
            verbose: {
                description: "Show mode, modification time, size and encryption of each entry.",
                optional: true,
                default: false,
            },
        },
    },
)]
/// List the contents of the archive carried by this executable.
fn list(verbose: bool) -> Result<(), Error> {
    let listing = KavachContext::current()
        .and_then(|ctx| kavach::list_archive(&ctx))
        .map_err(|err| command_failed("list", err))?;

    log::debug!("{:?}", listing.header);
    for entry in listing.entries {
        if verbose {
            println!("{}", format_single_line_entry(&entry));
        } else {
            println!("{}", entry.path.display());
        }
    }

    Ok(())
}

fn main() {
    init_cli_logger("KAVACH_LOG", "info");

    // keep the reserved section in the image
    std::hint::black_box(&KAVACH_SECTION);

    let cmd_def = CliCommandMap::new()
        .insert(
            "pack",
            CliCommand::new(&API_METHOD_PACK)
                .arg_param(&["target"])
                .completion_cb("target", complete_file_name),
        )
        .insert(
            "unpack",
            CliCommand::new(&API_METHOD_UNPACK).completion_cb("target-dir", complete_file_name),
        )
        .insert("list", CliCommand::new(&API_METHOD_LIST))
        .insert_help();
    let def = CommandLineInterface::Nested(cmd_def);

    let mut args = std::env::args();
    let prefix = args.next().unwrap_or_else(|| "kavach".to_string());
    let prefix = prefix.rsplit('/').next().unwrap_or("kavach").to_string();
    let args: Vec<String> = args.collect();

    if args.first().map(String::as_str) == Some("bashcomplete") {
        print_bash_completion(&def);
        return;
    }

    // failed runs exit with the code of their failure class, everything
    // else is a command line error
    if let Err(err) = handle_command(Arc::new(def), &prefix, args, CliEnvironment::new(), None) {
        let code = match err.downcast_ref::<CommandFailed>() {
            Some(failed) => failed.class.exit_code(),
            None => -1,
        };
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use kavach::KavachError;

    use super::*;

    #[test]
    fn failed_runs_keep_their_class() {
        let err = command_failed(
            "unpack",
            KavachError::MissingKey(PathBuf::from("a.txt")).into(),
        );
        let failed = err.downcast_ref::<CommandFailed>().unwrap();
        assert_eq!(failed.class, ErrorClass::Policy);
        assert_eq!(err.to_string(), "unpack failed");

        let err = command_failed("pack", std::io::Error::from(std::io::ErrorKind::NotFound).into());
        assert_eq!(err.downcast_ref::<CommandFailed>().unwrap().class.exit_code(), 10);
    }
}
