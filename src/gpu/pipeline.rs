//! # Compute Pipeline Construction and Cache
//!
//! This module builds compute pipelines stage by stage and caches the
//! pipelines of the built-in conversion kernels.
//!
//! ## Build stages
//!
//! A pipeline depends on four device objects, created in dependency order:
//!
//! 1. shader module (compiled WGSL),
//! 2. bind group layout (one storage entry per populated slot),
//! 3. pipeline layout,
//! 4. compute pipeline.
//!
//! Each stage runs inside [`GPUContext::capture`] so compile and validation
//! failures come back as [`DeviceError::ShaderCompilation`] naming the stage,
//! and a failing stage stops the build before the next one starts.
//! [`ComputeShader`](crate::gpu::ComputeShader) calls the stages one at a time
//! so it can count them; the conversion cache uses [`create_pipeline`].
//!
//! ## Binding model
//!
//! User shaders bind every populated slot as a `read_write` storage buffer in
//! group 0. Conversion kernels use a fixed layout:
//!
//! * binding 0 - read-only storage, source words
//! * binding 1 - read-write storage, destination words
//! * binding 2 - uniform [`ConversionParams`]
//!
//! ## Thread safety
//! Everything here runs on the device thread.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::engine::error::{DeviceError, GpuResult};
use crate::gpu::context::GPUContext;
use crate::gpu::kernels::ConversionKernel;


/// Entry point used by all built-in kernels.
pub const ENTRY_POINT: &str = "main";

#[inline]
fn stage_error(stage: &'static str) -> impl FnOnce(String) -> DeviceError {
    move |message| DeviceError::ShaderCompilation { stage, message: message.into() }
}

/// Storage buffer layout entry visible to compute shaders.
pub fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Uniform buffer layout entry visible to compute shaders.
pub fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Stage 1: compiles WGSL source.
pub fn create_module(context: &GPUContext, label: &str, source: &str) -> GpuResult<wgpu::ShaderModule> {
    let module = context
        .capture(|| {
            context.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        })
        .map_err(stage_error("shader module"))?;
    Ok(module)
}

/// Stage 2: creates the bind group layout.
pub fn create_bind_group_layout(
    context: &GPUContext,
    label: &str,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> GpuResult<wgpu::BindGroupLayout> {
    let layout = context
        .capture(|| {
            context.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries,
            })
        })
        .map_err(stage_error("bind group layout"))?;
    Ok(layout)
}

/// Stage 3: creates a single-group pipeline layout.
pub fn create_pipeline_layout(
    context: &GPUContext,
    label: &str,
    bind_group_layout: &wgpu::BindGroupLayout,
) -> GpuResult<wgpu::PipelineLayout> {
    let layout = context
        .capture(|| {
            context.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[bind_group_layout],
                push_constant_ranges: &[],
            })
        })
        .map_err(stage_error("pipeline layout"))?;
    Ok(layout)
}

/// Stage 4: creates the compute pipeline.
pub fn create_compute_pipeline(
    context: &GPUContext,
    label: &str,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> GpuResult<wgpu::ComputePipeline> {
    let pipeline = context
        .capture(|| {
            context.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(layout),
                module,
                entry_point: Some(entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        })
        .map_err(stage_error("compute pipeline"))?;
    Ok(pipeline)
}

/// A compute pipeline together with the layout its bind groups must use.

#[derive(Debug)]
pub struct CompiledPipeline {
    /// The pipeline.
    pub pipeline: wgpu::ComputePipeline,
    /// Layout of bind group 0.
    pub bind_group_layout: wgpu::BindGroupLayout,
}

/// Runs all four stages for `source`.
pub fn create_pipeline(
    context: &GPUContext,
    label: &str,
    source: &str,
    entry_point: &str,
    entries: &[wgpu::BindGroupLayoutEntry],
) -> GpuResult<CompiledPipeline> {
    let module = create_module(context, label, source)?;
    let bind_group_layout = create_bind_group_layout(context, label, entries)?;
    let layout = create_pipeline_layout(context, label, &bind_group_layout)?;
    let pipeline = create_compute_pipeline(context, label, &layout, &module, entry_point)?;
    Ok(CompiledPipeline { pipeline, bind_group_layout })
}

/// Uniform block read by every conversion kernel.

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ConversionParams {
    /// Logical element count.
    pub count: u32,
    /// Packed word count.
    pub words: u32,
    /// Padding to 16 bytes.
    pub _p0: u32,
    /// Padding to 16 bytes.
    pub _p1: u32,
}

/// Cache of conversion-kernel pipelines.
///
/// ## Role
/// Each conversion kernel is compiled at most once per device and reused by
/// every later transfer.
///
/// ## Thread safety
/// Owned by the device thread's runtime; never shared.

#[derive(Debug, Default)]
pub struct PipelineCache {
    map: HashMap<ConversionKernel, CompiledPipeline>,
}

impl PipelineCache {
    /// Creates an empty pipeline cache.
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    /// Number of compiled kernels.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// `true` when nothing has been compiled yet.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Retrieves the pipeline for `kernel`, compiling it on first use.
    ///
    /// ## Errors
    /// Returns [`DeviceError::ShaderCompilation`] if any build stage fails.
    /// Nothing is cached on failure.

    pub fn get_or_create(
        &mut self,
        context: &GPUContext,
        kernel: ConversionKernel,
    ) -> GpuResult<&CompiledPipeline> {
        match self.map.entry(kernel) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                log::debug!("compiling conversion kernel {}", kernel.name());
                let label = context.label(kernel.name());
                let entries = [storage_entry(0, true), storage_entry(1, false), uniform_entry(2)];
                let compiled = create_pipeline(
                    context,
                    &label,
                    &kernel.wgsl(),
                    ENTRY_POINT,
                    &entries,
                )?;
                Ok(entry.insert(compiled))
            }
        }
    }
}
