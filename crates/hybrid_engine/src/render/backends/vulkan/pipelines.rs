//! Shader modules, render passes and pipeline creation

use std::ffi::CStr;

use ash::extensions::khr::RayTracingPipeline;
use ash::vk;

use crate::foundation::logging::debug;
use crate::render::api::{DeviceError, DeviceResult, GraphicsPipelineDesc, RayTracingPipelineDesc, RenderPassDesc};

fn entry_point() -> &'static CStr {
    // SAFETY: literal is nul-terminated without interior nuls
    unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") }
}

fn create_shader_module(device: &ash::Device, spirv: &[u32]) -> DeviceResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(spirv);
    Ok(unsafe { device.create_shader_module(&create_info, None)? })
}

/// Shader modules destroyed together once the pipeline exists
struct ModuleSet<'a> {
    device: &'a ash::Device,
    modules: Vec<vk::ShaderModule>,
}

impl<'a> ModuleSet<'a> {
    fn new(device: &'a ash::Device) -> Self {
        Self {
            device,
            modules: Vec::new(),
        }
    }

    fn stage(&mut self, spirv: &[u32], stage: vk::ShaderStageFlags) -> DeviceResult<vk::PipelineShaderStageCreateInfo> {
        let module = create_shader_module(self.device, spirv)?;
        self.modules.push(module);
        Ok(vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(module)
            .name(entry_point())
            .build())
    }
}

impl Drop for ModuleSet<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }
}

/// Single-subpass pass clearing every attachment on load
pub(super) fn create_render_pass(device: &ash::Device, desc: &RenderPassDesc) -> DeviceResult<vk::RenderPass> {
    let mut attachments: Vec<vk::AttachmentDescription> = desc
        .color_formats
        .iter()
        .map(|&format| {
            vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(desc.final_color_layout)
                .build()
        })
        .collect();
    let color_refs: Vec<vk::AttachmentReference> = (0..desc.color_formats.len() as u32)
        .map(|attachment| vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        })
        .collect();
    let depth_ref = vk::AttachmentReference {
        attachment: desc.color_formats.len() as u32,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(format) = desc.depth_format {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        );
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }

    let attachment_stages =
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let dependencies = [
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(attachment_stages)
            .dst_stage_mask(attachment_stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build(),
        vk::SubpassDependency::builder()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(
                vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
                    | vk::PipelineStageFlags::TRANSFER,
            )
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::TRANSFER_READ)
            .build(),
    ];

    let subpasses = [subpass.build()];
    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    Ok(unsafe { device.create_render_pass(&render_pass_info, None)? })
}

pub(super) fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
) -> DeviceResult<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
    Ok(unsafe { device.create_pipeline_layout(&layout_info, None)? })
}

/// Graphics pipeline with dynamic viewport and scissor
pub(super) fn create_graphics_pipeline(
    device: &ash::Device,
    desc: &GraphicsPipelineDesc<'_>,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
) -> DeviceResult<vk::Pipeline> {
    let mut modules = ModuleSet::new(device);
    let stages = [
        modules.stage(desc.vertex_spirv, vk::ShaderStageFlags::VERTEX)?,
        modules.stage(desc.fragment_spirv, vk::ShaderStageFlags::FRAGMENT)?,
    ];

    let (bindings, attributes) = match &desc.vertex_input {
        Some(input) => (
            vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: input.stride,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            input
                .attributes
                .iter()
                .map(|a| vk::VertexInputAttributeDescription {
                    location: a.location,
                    binding: 0,
                    format: a.format,
                    offset: a.offset,
                })
                .collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::builder().topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(desc.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample =
        vk::PipelineMultisampleStateCreateInfo::builder().rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
    let blend_attachments = vec![
        vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();
        desc.color_attachment_count as usize
    ];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
            .map_err(|(_, err)| DeviceError::Api(err))?
    };
    debug!("[SHADER] Graphics pipeline '{}' created", desc.name);
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| DeviceError::invalid("driver returned no pipeline"))
}

fn general_group(shader: u32) -> vk::RayTracingShaderGroupCreateInfoKHR {
    vk::RayTracingShaderGroupCreateInfoKHR::builder()
        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
        .general_shader(shader)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
        .build()
}

fn hit_group(closest_hit: u32) -> vk::RayTracingShaderGroupCreateInfoKHR {
    vk::RayTracingShaderGroupCreateInfoKHR::builder()
        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(closest_hit)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
        .build()
}

/// Ray-tracing pipeline with groups ordered raygen, misses, closest hits
pub(super) fn create_ray_tracing_pipeline(
    device: &ash::Device,
    loader: &RayTracingPipeline,
    desc: &RayTracingPipelineDesc<'_>,
    layout: vk::PipelineLayout,
) -> DeviceResult<vk::Pipeline> {
    let mut modules = ModuleSet::new(device);
    let mut stages = vec![modules.stage(desc.raygen_spirv, vk::ShaderStageFlags::RAYGEN_KHR)?];
    let mut groups = vec![general_group(0)];

    for miss in &desc.miss_spirv {
        groups.push(general_group(stages.len() as u32));
        stages.push(modules.stage(miss, vk::ShaderStageFlags::MISS_KHR)?);
    }
    for hit in &desc.closest_hit_spirv {
        groups.push(hit_group(stages.len() as u32));
        stages.push(modules.stage(hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?);
    }

    let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::builder()
        .stages(&stages)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
        .layout(layout);

    let pipelines = unsafe {
        loader.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[pipeline_info.build()],
            None,
        )?
    };
    debug!(
        "[SHADER] Ray-tracing pipeline '{}' created with {} groups",
        desc.name,
        groups.len()
    );
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| DeviceError::invalid("driver returned no pipeline"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_is_main() {
        assert_eq!(entry_point().to_str().unwrap(), "main");
    }

    #[test]
    fn test_shader_groups_reference_one_stage_each() {
        let general = general_group(2);
        assert_eq!(general.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(general.general_shader, 2);
        assert_eq!(general.closest_hit_shader, vk::SHADER_UNUSED_KHR);

        let hit = hit_group(3);
        assert_eq!(hit.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(hit.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(hit.closest_hit_shader, 3);
    }
}
