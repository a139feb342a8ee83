use crate::cli::args::ValidateArgs;
use crate::exit_codes::EXIT_SUCCESS;
use sqlgen_core::RunConfig;

pub async fn run(args: ValidateArgs) -> anyhow::Result<i32> {
    let cfg = RunConfig::load(&args.config)?;
    println!(
        "{}: ok ({} generators, selector {}, linking {})",
        args.config.display(),
        cfg.generators.len(),
        if cfg.selector.is_some() { "on" } else { "off" },
        if cfg.linking.enabled { "on" } else { "off" },
    );
    for g in &cfg.generators {
        println!(
            "  config {}: {} style={} shots={} refine={}",
            g.config_id,
            g.model.name(),
            g.prompt_config.style.as_str(),
            g.prompt_config.shots,
            g.improve.as_ref().map_or(0, |r| r.max_attempts),
        );
    }
    Ok(EXIT_SUCCESS)
}
