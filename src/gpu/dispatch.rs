//! # Dispatch
//!
//! Device-thread half of [`ComputeShader::dispatch`]: resolves bindings,
//! rebuilds whatever cached state is stale and submits one command buffer.
//!
//! ## Execution flow
//!
//! 1. Re-check the group counts against the device-clamped ceiling.
//! 2. Resolve every bound slot to a live buffer and lock it. A dropped buffer
//!    or a buffer without an allocation rejects the dispatch.
//! 3. Compare each binding's recorded [`AllocationId`] with the buffer's
//!    current allocation; a difference marks the bind group dirty.
//! 4. If the pipeline is dirty, rebuild module, bind group layout, pipeline
//!    layout and pipeline. A failed stage aborts and leaves the pipeline dirty
//!    so the next dispatch retries.
//! 5. If the bind group is dirty, rebuild it.
//! 6. Encode a single compute pass and submit it.
//!
//! Nothing waits for the device to finish; later reads poll for completion.
//!
//! [`ComputeShader::dispatch`]: crate::gpu::ComputeShader::dispatch
//! [`AllocationId`]: crate::engine::types::AllocationId

use std::sync::Arc;

use crate::engine::error::{DeviceError, DispatchError, GpuResult};
use crate::gpu::buffer::BufferShared;
use crate::gpu::context::GPUContext;
use crate::gpu::executor::Runtime;
use crate::gpu::pipeline;
use crate::gpu::shader::{BuildCounters, CachedPipeline, ShaderInner};


/// Builds the four pipeline stages for a shader whose populated slots are
/// `slots`, counting each stage as it succeeds.

fn build_pipeline(
    context: &GPUContext,
    counters: &BuildCounters,
    source: &str,
    entry_point: &str,
    slots: &[u32],
) -> GpuResult<CachedPipeline> {
    let label = context.label("shader");

    let module = pipeline::create_module(context, &label, source)?;
    BuildCounters::bump(&counters.shader_modules);

    let entries: Vec<wgpu::BindGroupLayoutEntry> = slots
        .iter()
        .map(|&slot| pipeline::storage_entry(slot, false))
        .collect();
    let bind_group_layout = pipeline::create_bind_group_layout(context, &label, &entries)?;
    BuildCounters::bump(&counters.bind_group_layouts);

    let layout = pipeline::create_pipeline_layout(context, &label, &bind_group_layout)?;
    BuildCounters::bump(&counters.pipeline_layouts);

    let pipeline = pipeline::create_compute_pipeline(context, &label, &layout, &module, entry_point)?;
    BuildCounters::bump(&counters.pipelines);

    log::debug!("built pipeline `{entry_point}` with {} binding(s)", slots.len());
    Ok(CachedPipeline { pipeline, bind_group_layout })
}

/// Runs one dispatch of `shader` on the device thread.
///
/// ## Errors
/// * [`DispatchError`] for an unsafe size, missing source, or a stale or
///   unallocated binding. Nothing is submitted.
/// * [`DeviceError`] if a build stage or the submission fails.

pub(crate) fn submit(
    runtime: &mut Runtime,
    shader: &ShaderInner,
    groups: [u32; 3],
) -> GpuResult<wgpu::SubmissionIndex> {
    let [x, y, z] = groups;
    runtime.limits.check(x, y, z)?;

    let mut guard = shader.lock()?;
    let state = &mut *guard;
    if state.source.is_none() {
        return Err(DispatchError::MissingSource.into());
    }

    // Resolve slots to live buffers, locking each distinct buffer once.
    let mut owners: Vec<Arc<BufferShared>> = Vec::new();
    let mut slots: Vec<(u32, usize)> = Vec::new();
    for (index, binding) in state.bindings.iter().enumerate() {
        let Some(binding) = binding else { continue };
        let slot = index as u32;
        let owner = binding
            .source
            .upgrade()
            .ok_or(DispatchError::StaleBinding { slot })?;
        let position = match owners.iter().position(|o| Arc::ptr_eq(o, &owner)) {
            Some(position) => position,
            None => {
                owners.push(owner);
                owners.len() - 1
            }
        };
        slots.push((slot, position));
    }
    let buffers = owners
        .iter()
        .map(|owner| owner.lock())
        .collect::<Result<Vec<_>, _>>()?;

    for &(slot, position) in &slots {
        let allocation = buffers[position]
            .allocation
            .as_ref()
            .ok_or(DispatchError::UnallocatedBinding { slot })?;
        if let Some(binding) = state.bindings[slot as usize].as_mut() {
            if binding.allocation != Some(allocation.id) {
                log::debug!(
                    "slot {slot}: allocation changed ({} bytes -> {} bytes)",
                    binding.size,
                    allocation.size
                );
                binding.allocation = Some(allocation.id);
                binding.size = allocation.size;
                state.bindings_dirty = true;
            }
        }
    }

    let context = &runtime.context;

    if state.pipeline_dirty || state.cached.is_none() {
        state.cached = None;
        state.bind_group = None;
        let populated: Vec<u32> = slots.iter().map(|&(slot, _)| slot).collect();
        let source = state.source.as_deref().unwrap_or_default();
        let cached = build_pipeline(context, &shader.stats, source, &state.entry_point, &populated)
            .inspect_err(|e| log::error!("pipeline rebuild failed: {e}"))?;
        state.cached = Some(cached);
        state.pipeline_dirty = false;
        state.bindings_dirty = true;
    }

    let Some(cached) = state.cached.as_ref() else {
        return Err(DispatchError::MissingSource.into());
    };

    if state.bindings_dirty || state.bind_group.is_none() {
        let entries: Vec<wgpu::BindGroupEntry<'_>> = slots
            .iter()
            .filter_map(|&(slot, position)| {
                buffers[position].allocation.as_ref().map(|allocation| wgpu::BindGroupEntry {
                    binding: slot,
                    resource: allocation.buffer.as_entire_binding(),
                })
            })
            .collect();
        let bind_group = context
            .capture(|| {
                context.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("minigpu_bind_group"),
                    layout: &cached.bind_group_layout,
                    entries: &entries,
                })
            })
            .map_err(|message| DeviceError::ShaderCompilation {
                stage: "bind group",
                message: message.into(),
            })?;
        BuildCounters::bump(&shader.stats.bind_groups);
        state.bind_group = Some(bind_group);
        state.bindings_dirty = false;
    }

    let Some(bind_group) = state.bind_group.as_ref() else {
        return Err(DispatchError::MissingSource.into());
    };

    let mut encoder = context.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("minigpu_compute_encoder"),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("minigpu_compute_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&cached.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(x, y, z);
    }

    let submission = context
        .capture(|| context.queue.submit(Some(encoder.finish())))
        .map_err(|message| DeviceError::SubmissionFailed { message: message.into() })?;

    state.last_groups = Some(groups);
    log::trace!("dispatched {x}x{y}x{z} over {} binding(s)", slots.len());
    Ok(submission)
}
