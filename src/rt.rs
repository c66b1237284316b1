use anyhow::Context;

/// Runs a phase to completion. Each phase does one thing at a time, so a
/// current-thread runtime is enough.
pub fn block_on<F, Fut>(f: F) -> anyhow::Result<Fut>
where
    F: Future<Output = Fut>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "Failed to build Tokio runtime for the phase")?;
    Ok(rt.block_on(f))
}
