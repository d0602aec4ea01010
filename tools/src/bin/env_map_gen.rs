use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    ember_tools::env_map_gen::run(std::env::args().skip(1))
}
