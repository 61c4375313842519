//! `llamachat bench`: Warm-up and standard benchmark reports.

use llamachat_chat::ChatOrchestrator;

pub async fn run(
    model: Option<String>,
    pp: u32,
    tg: u32,
    pl: u32,
    nr: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = super::build(model).await?;
    if !orchestrator.bridge().is_loaded() {
        return Err("No model loaded. Pass --model or set LLAMACHAT_MODEL.".into());
    }
    report(&orchestrator, pp, tg, pl, nr).await;
    Ok(())
}

pub async fn report(orchestrator: &ChatOrchestrator, pp: u32, tg: u32, pl: u32, nr: u32) {
    println!("  Running warm-up (pp {pp}, tg {tg}, pl {pl}, nr {nr})...");
    match orchestrator.bench(pp, tg, pl, nr).await {
        Ok(outcome) => {
            println!("{}", outcome.warmup_report);
            println!("  Warm up time: {:.2} sec", outcome.warmup_secs);
            match outcome.report {
                Some(report) => println!("{report}"),
                None => println!("  Warm up time too long, benchmark aborted."),
            }
        }
        Err(e) => eprintln!("  [Error] {e}"),
    }
}
