use stagecue::engine::tuning::EngineTuning;
use stagecue::ipc;
use stagecue::output::stream::OutputConfig;
use stagecue::CueEngine;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let tuning = EngineTuning::load();
    log::info!(
        "starting engine: block {} frames, target {} blocks",
        tuning.block_frames,
        tuning.output_target_blocks
    );

    let config = OutputConfig::from_tuning(&tuning);
    let (mut handle, events) = CueEngine::spawn(tuning, config);

    if let Err(e) = ipc::serve_stdio(&handle, events) {
        log::error!("ipc loop failed: {e}");
    }

    handle.shutdown();
}
