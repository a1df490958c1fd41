use std::path::Path;

use argh::{EarlyExit, FromArgs, TopLevelCommand};

struct ArgsOrVersion<T: FromArgs>(T);

impl<T: FromArgs> TopLevelCommand for ArgsOrVersion<T> {}

impl<T: FromArgs> FromArgs for ArgsOrVersion<T> {
    fn from_args(command_name: &[&str], args: &[&str]) -> Result<Self, EarlyExit> {
        if args.len() == 1 && (args[0] == "--version" || args[0] == "-V") {
            return Err(EarlyExit {
                output: format!("{} {}", command_name.join(" "), env!("CARGO_PKG_VERSION")),
                status: Ok(()),
            });
        }
        T::from_args(command_name, args).map(Self)
    }
}

/// Like `argh::from_env`, but additionally handles `--version`/`-V`.
pub fn from_env<T: TopLevelCommand>() -> T {
    let strings: Vec<String> = std::env::args().collect();
    let command_name =
        Path::new(&strings[0]).file_name().and_then(|s| s.to_str()).unwrap_or(&strings[0]);
    let strs: Vec<&str> = strings.iter().map(String::as_str).collect();
    ArgsOrVersion::<T>::from_args(&[command_name], &strs[1..]).map(|v| v.0).unwrap_or_else(
        |early_exit| {
            std::process::exit(match early_exit.status {
                Ok(()) => {
                    println!("{}", early_exit.output);
                    0
                }
                Err(()) => {
                    eprintln!("{}", early_exit.output);
                    1
                }
            })
        },
    )
}
