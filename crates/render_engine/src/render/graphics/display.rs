//! Display: GPU session, swapchain, submission
//!
//! The display owns the Vulkan context, the swapchain, and the arenas of
//! cameras, shaders, materials, renderers, and textures. Every frame it
//! consumes the dirty flags those objects accumulated, re-records exactly
//! the stale command buffers, and submits one primary per swapchain image.
//! GPU object destruction and re-recording block on device idle; the clean
//! path resubmits cached primaries without touching any of it.

use ash::{vk, Device};
use slotmap::{new_key_type, Key, SlotMap};

use crate::config::DisplayConfig;
use crate::render::backend::GraphicsBackend;
use crate::render::graphics::camera::{Camera, CameraDirty, CameraKey};
use crate::render::graphics::material::{Invalidate, Material, MaterialKey};
use crate::render::graphics::renderer::{Renderer, RendererKey};
use crate::render::graphics::shader::{Shader, ShaderDesc, ShaderKey};
use crate::render::graphics::shader_cache::{ShaderByteCache, ShaderCompiler};
use crate::render::vulkan::buffer::{IndexBuffer, UniformBuffer, VertexBuffer};
use crate::render::vulkan::commands::CommandPool;
use crate::render::vulkan::context::VulkanContext;
use crate::render::vulkan::descriptor::DescriptorPool;
use crate::render::vulkan::framebuffer::Framebuffer;
use crate::render::vulkan::pipeline::Vertex;
use crate::render::vulkan::render_pass::{RenderPass, RenderTargetDesc};
use crate::render::vulkan::swapchain::Swapchain;
use crate::render::vulkan::sync::FrameSync;
use crate::render::vulkan::texture::{cmd_transition_layout, Texture};
use crate::render::vulkan::window::Window;
use crate::render::vulkan::{VulkanError, VulkanResult};

new_key_type! {
    /// Arena key for textures
    pub struct TextureKey;
}

/// Frame slots the CPU may run ahead of the GPU
const FRAMES_IN_FLIGHT: usize = 2;

/// Slot used by the most recently submitted frame
fn previous_frame_slot(frame: usize) -> usize {
    (frame + FRAMES_IN_FLIGHT - 1) % FRAMES_IN_FLIGHT
}

fn not_found<K: Key>(key: K) -> VulkanError {
    VulkanError::ResourceNotFound {
        id: key.data().as_ffi(),
    }
}

/// GPU session owning the device, swapchain, and all rendering resources
pub struct Display {
    cameras: SlotMap<CameraKey, Camera>,
    camera_order: Vec<CameraKey>,
    shaders: SlotMap<ShaderKey, Shader>,
    materials: SlotMap<MaterialKey, Material>,
    renderers: SlotMap<RendererKey, Renderer>,
    textures: SlotMap<TextureKey, Texture>,

    depth_texture: Texture,
    primary_cmds: Vec<vk::CommandBuffer>,
    primary_cmd_dirty: bool,
    frame_syncs: Vec<FrameSync>,
    current_frame: usize,
    compute_wait: Option<vk::Semaphore>,

    pipeline_cache: vk::PipelineCache,
    shader_cache: ShaderByteCache,
    descriptor_pool: DescriptorPool,
    command_pool: CommandPool,
    swapchain: Option<Swapchain>,
    msaa_samples: vk::SampleCountFlags,
    vsync: bool,
    paused: bool,

    // Dropped last; everything above holds objects created from it
    context: VulkanContext,
}

impl Display {
    /// Initialize the GPU session against an existing window
    pub fn new(window: &mut Window, config: &DisplayConfig) -> VulkanResult<Self> {
        let context = VulkanContext::new(window, &config.title, config.enable_validation)?;
        let device = context.raw_device();

        let (width, height) = window.get_framebuffer_size();
        let swapchain = Swapchain::new(
            context.instance(),
            device.clone(),
            context.surface(),
            context.surface_loader(),
            context.physical_device(),
            vk::Extent2D { width, height },
            config.vsync,
        )?;

        let command_pool = CommandPool::new(device.clone(), context.graphics_queue_family())?;
        let descriptor_pool = DescriptorPool::new(device.clone())?;

        let depth_texture = Texture::depth_target(
            device.clone(),
            context.instance(),
            context.physical_device().device,
            swapchain.extent(),
            context.depth_format(),
            vk::SampleCountFlags::TYPE_1,
        )?;

        let primary_cmds = command_pool.allocate_primary(swapchain.image_count() as u32)?;

        let frame_syncs = (0..FRAMES_IN_FLIGHT)
            .map(|_| FrameSync::new(device.clone()))
            .collect::<VulkanResult<Vec<_>>>()?;

        let cache_info = vk::PipelineCacheCreateInfo::builder();
        let pipeline_cache = unsafe {
            device
                .create_pipeline_cache(&cache_info, None)
                .map_err(VulkanError::Api)?
        };

        let shader_cache = ShaderByteCache::new(&config.shader_cache_dir)?;
        let msaa_samples = context.clamp_sample_count(config.msaa_samples);

        log::info!(
            "Display initialized on {} ({}x{}, vsync: {}, msaa: {:?})",
            context.adapter_name(),
            swapchain.extent().width,
            swapchain.extent().height,
            config.vsync,
            msaa_samples
        );

        Ok(Self {
            cameras: SlotMap::with_key(),
            camera_order: Vec::new(),
            shaders: SlotMap::with_key(),
            materials: SlotMap::with_key(),
            renderers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            depth_texture,
            primary_cmds,
            primary_cmd_dirty: false,
            frame_syncs,
            current_frame: 0,
            compute_wait: None,
            pipeline_cache,
            shader_cache,
            descriptor_pool,
            command_pool,
            swapchain: Some(swapchain),
            msaa_samples,
            vsync: config.vsync,
            paused: false,
            context,
        })
    }

    /// Backend capability interface
    pub fn backend(&self) -> &dyn GraphicsBackend {
        &self.context
    }

    /// Default sample count for offscreen render targets
    pub fn msaa_samples(&self) -> vk::SampleCountFlags {
        self.msaa_samples
    }

    /// Block until the GPU retires all submitted work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        self.context.wait_idle()
    }

    // --- cameras ---

    /// Create a camera targeting the swapchain, drawn at the given depth
    pub fn create_camera(&mut self, depth: i32) -> CameraKey {
        let key = self.cameras.insert(Camera::new(depth));
        self.camera_order.push(key);
        self.sort_camera_order();
        self.primary_cmd_dirty = true;
        key
    }

    /// Destroy a camera and everything keyed by its render pass
    pub fn destroy_camera(&mut self, key: CameraKey) -> VulkanResult<()> {
        self.context.wait_idle()?;
        let mut camera = self.cameras.remove(key).ok_or_else(|| not_found(key))?;

        let freed = camera.take_secondaries();
        let (old_pass, _old_framebuffers) = camera.take_pass();
        if let Some(pass) = &old_pass {
            for shader in self.shaders.values_mut() {
                shader.on_render_pass_destroy(pass.handle());
            }
        }

        self.command_pool.free(&freed);
        self.camera_order.retain(|&k| k != key);
        self.primary_cmd_dirty = true;
        log::debug!("Destroyed camera {:?}", key);
        Ok(())
    }

    /// Look up a camera
    pub fn camera(&self, key: CameraKey) -> Option<&Camera> {
        self.cameras.get(key)
    }

    /// Mutable access to a camera; dirty flags it sets are consumed by the
    /// next update
    pub fn camera_mut(&mut self, key: CameraKey) -> Option<&mut Camera> {
        self.cameras.get_mut(key)
    }

    /// Change a camera's draw-order depth and re-sort the frame
    pub fn set_camera_depth(&mut self, key: CameraKey, depth: i32) -> VulkanResult<()> {
        let camera = self.cameras.get_mut(key).ok_or_else(|| not_found(key))?;
        camera.set_depth(depth);
        self.sort_camera_order();
        self.primary_cmd_dirty = true;
        Ok(())
    }

    /// Cameras in draw order
    pub fn camera_order(&self) -> &[CameraKey] {
        &self.camera_order
    }

    /// Attach a renderer to a camera's draw list
    pub fn attach_renderer(
        &mut self,
        camera: CameraKey,
        renderer: RendererKey,
    ) -> VulkanResult<()> {
        if !self.renderers.contains_key(renderer) {
            return Err(not_found(renderer));
        }
        let camera = self.cameras.get_mut(camera).ok_or_else(|| not_found(camera))?;
        camera.add_renderer(renderer);
        self.primary_cmd_dirty = true;
        Ok(())
    }

    /// Detach a renderer from a camera, freeing its cached secondary once
    /// the GPU is idle
    pub fn detach_renderer(
        &mut self,
        camera: CameraKey,
        renderer: RendererKey,
    ) -> VulkanResult<()> {
        let cmd = {
            let camera = self.cameras.get_mut(camera).ok_or_else(|| not_found(camera))?;
            camera.remove_renderer(renderer)
        };
        if let Some(cmd) = cmd {
            self.context.wait_idle()?;
            self.command_pool.free(&[cmd]);
        }
        self.primary_cmd_dirty = true;
        Ok(())
    }

    fn sort_camera_order(&mut self) {
        let cameras = &self.cameras;
        self.camera_order
            .sort_by_key(|&k| cameras.get(k).map_or(i32::MAX, |c| c.depth()));
    }

    // --- shaders ---

    /// Compile and register a shader
    pub fn create_shader(
        &mut self,
        compiler: &dyn ShaderCompiler,
        desc: ShaderDesc,
    ) -> VulkanResult<ShaderKey> {
        let shader = Shader::new(
            self.context.raw_device(),
            &self.shader_cache,
            compiler,
            desc,
        )?;
        Ok(self.shaders.insert(shader))
    }

    /// Destroy a shader. Fails while any material still references it.
    pub fn destroy_shader(&mut self, key: ShaderKey) -> VulkanResult<()> {
        if self.materials.values().any(|m| m.shader() == key) {
            return Err(VulkanError::InvalidOperation {
                reason: "Shader is still referenced by a material".to_string(),
            });
        }
        self.context.wait_idle()?;
        self.shaders.remove(key).ok_or_else(|| not_found(key))?;
        Ok(())
    }

    /// Look up a shader
    pub fn shader(&self, key: ShaderKey) -> Option<&Shader> {
        self.shaders.get(key)
    }

    // --- materials ---

    /// Create a material instance of a shader: one descriptor set and one
    /// uniform buffer per declared block, with buffer descriptors written
    /// up front
    pub fn create_material(&mut self, shader_key: ShaderKey) -> VulkanResult<MaterialKey> {
        let shader = self
            .shaders
            .get(shader_key)
            .ok_or_else(|| not_found(shader_key))?;
        let device = self.context.raw_device();

        let set = self.descriptor_pool.allocate(shader.descriptor_layout())?;

        let mut uniform_buffers = Vec::with_capacity(shader.uniform_layout().buffers.len());
        for binding in &shader.uniform_layout().buffers {
            let buffer = UniformBuffer::new(
                device.clone(),
                self.context.instance(),
                self.context.physical_device().device,
                binding.size.max(1) as vk::DeviceSize,
            )?;

            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: buffer.handle(),
                offset: 0,
                range: binding.size.max(1) as vk::DeviceSize,
            }];
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(binding.binding)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info);
            unsafe {
                device.update_descriptor_sets(&[write.build()], &[]);
            }

            uniform_buffers.push(buffer);
        }

        let mut material = Material::new(shader_key);
        material.attach_gpu(set, uniform_buffers);
        Ok(self.materials.insert(material))
    }

    /// Destroy a material. Renderers still bound to it stop drawing until
    /// re-bound.
    pub fn destroy_material(&mut self, key: MaterialKey) -> VulkanResult<()> {
        self.context.wait_idle()?;
        let material = self.materials.remove(key).ok_or_else(|| not_found(key))?;
        self.descriptor_pool.free(material.descriptor_set())?;
        self.mark_material_renderers_dirty(key);
        Ok(())
    }

    /// Set a float property on a material
    pub fn set_material_float(
        &mut self,
        key: MaterialKey,
        name: &str,
        value: f32,
    ) -> VulkanResult<()> {
        let material = self.materials.get_mut(key).ok_or_else(|| not_found(key))?;
        material.set_float(name, value);
        Ok(())
    }

    /// Set an integer property on a material
    pub fn set_material_int(
        &mut self,
        key: MaterialKey,
        name: &str,
        value: i32,
    ) -> VulkanResult<()> {
        let material = self.materials.get_mut(key).ok_or_else(|| not_found(key))?;
        material.set_int(name, value);
        Ok(())
    }

    /// Set a vector property on a material
    pub fn set_material_vector(
        &mut self,
        key: MaterialKey,
        name: &str,
        value: crate::foundation::math::Vec4,
    ) -> VulkanResult<()> {
        let material = self.materials.get_mut(key).ok_or_else(|| not_found(key))?;
        material.set_vector(name, value);
        Ok(())
    }

    /// Set a color property on a material
    pub fn set_material_color(
        &mut self,
        key: MaterialKey,
        name: &str,
        value: crate::foundation::math::Color,
    ) -> VulkanResult<()> {
        let material = self.materials.get_mut(key).ok_or_else(|| not_found(key))?;
        material.set_color(name, value);
        Ok(())
    }

    /// Set a matrix property on a material
    pub fn set_material_matrix(
        &mut self,
        key: MaterialKey,
        name: &str,
        value: crate::foundation::math::Mat4,
    ) -> VulkanResult<()> {
        let material = self.materials.get_mut(key).ok_or_else(|| not_found(key))?;
        material.set_matrix(name, value);
        Ok(())
    }

    /// Bind a texture to a material's named sampler slot
    pub fn set_material_texture(
        &mut self,
        key: MaterialKey,
        name: &str,
        texture: TextureKey,
    ) -> VulkanResult<()> {
        if !self.textures.contains_key(texture) {
            return Err(not_found(texture));
        }
        let material = self.materials.get_mut(key).ok_or_else(|| not_found(key))?;
        material.set_texture(name, texture);
        Ok(())
    }

    /// Override a material's sort queue
    pub fn set_material_queue(
        &mut self,
        key: MaterialKey,
        queue: Option<i32>,
    ) -> VulkanResult<()> {
        let material = self.materials.get_mut(key).ok_or_else(|| not_found(key))?;
        material.set_queue(queue);
        self.mark_material_order_stale(key);
        Ok(())
    }

    /// Look up a material
    pub fn material(&self, key: MaterialKey) -> Option<&Material> {
        self.materials.get(key)
    }

    fn mark_material_renderers_dirty(&mut self, material: MaterialKey) {
        let bound: Vec<RendererKey> = self
            .renderers
            .iter()
            .filter(|(_, r)| r.material() == Some(material))
            .map(|(k, _)| k)
            .collect();
        for camera in self.cameras.values_mut() {
            for &renderer in &bound {
                camera.mark_renderer_dirty(renderer);
            }
        }
    }

    fn mark_material_order_stale(&mut self, material: MaterialKey) {
        let bound: Vec<RendererKey> = self
            .renderers
            .iter()
            .filter(|(_, r)| r.material() == Some(material))
            .map(|(k, _)| k)
            .collect();
        for camera in self.cameras.values_mut() {
            if camera
                .instances()
                .iter()
                .any(|i| bound.contains(&i.renderer))
            {
                camera.mark_dirty(CameraDirty::RENDERER_ORDER);
            }
        }
        self.primary_cmd_dirty = true;
    }

    // --- renderers ---

    /// Upload mesh geometry and register a renderer for it
    pub fn create_renderer(
        &mut self,
        vertices: &[Vertex],
        indices: &[u16],
    ) -> VulkanResult<RendererKey> {
        let device = self.context.raw_device();
        let vertex_buffer = VertexBuffer::new(
            device.clone(),
            self.context.instance(),
            self.context.physical_device().device,
            vertices,
        )?;
        let index_buffer = IndexBuffer::new(
            device,
            self.context.instance(),
            self.context.physical_device().device,
            indices,
        )?;
        Ok(self
            .renderers
            .insert(Renderer::new(vertex_buffer, index_buffer)))
    }

    /// Destroy a renderer, detaching it from every camera
    pub fn destroy_renderer(&mut self, key: RendererKey) -> VulkanResult<()> {
        self.context.wait_idle()?;
        self.renderers.remove(key).ok_or_else(|| not_found(key))?;

        let mut freed = Vec::new();
        for camera in self.cameras.values_mut() {
            if let Some(cmd) = camera.remove_renderer(key) {
                freed.push(cmd);
            }
        }
        self.command_pool.free(&freed);
        self.primary_cmd_dirty = true;
        Ok(())
    }

    /// Bind a renderer to a material. Changes re-record and re-sort every
    /// camera the renderer is attached to.
    pub fn set_renderer_material(
        &mut self,
        key: RendererKey,
        material: Option<MaterialKey>,
    ) -> VulkanResult<()> {
        if let Some(mk) = material {
            if !self.materials.contains_key(mk) {
                return Err(not_found(mk));
            }
        }
        let renderer = self.renderers.get_mut(key).ok_or_else(|| not_found(key))?;
        if renderer.set_material(material) == Invalidate::Commands {
            for camera in self.cameras.values_mut() {
                if camera.instances().iter().any(|i| i.renderer == key) {
                    camera.mark_renderer_dirty(key);
                    camera.mark_dirty(CameraDirty::RENDERER_ORDER);
                }
            }
        }
        Ok(())
    }

    /// Restrict a renderer's draw to a sub-range of its index buffer
    pub fn set_renderer_draw_range(
        &mut self,
        key: RendererKey,
        first_index: u32,
        index_count: u32,
    ) -> VulkanResult<()> {
        let renderer = self.renderers.get_mut(key).ok_or_else(|| not_found(key))?;
        if renderer.set_draw_range(first_index, index_count) == Invalidate::Commands {
            for camera in self.cameras.values_mut() {
                camera.mark_renderer_dirty(key);
            }
        }
        Ok(())
    }

    /// Look up a renderer
    pub fn renderer(&self, key: RendererKey) -> Option<&Renderer> {
        self.renderers.get(key)
    }

    // --- textures ---

    /// Upload a sampled texture from raw pixel data
    pub fn create_texture_from_pixels(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> VulkanResult<TextureKey> {
        let texture = Texture::from_pixels(
            self.context.raw_device(),
            self.context.instance(),
            self.context.physical_device().device,
            &self.command_pool,
            self.context.graphics_queue(),
            pixels,
            vk::Extent2D { width, height },
            format,
        )?;
        Ok(self.textures.insert(texture))
    }

    /// Create an offscreen color target a camera can render into and later
    /// passes can sample
    pub fn create_color_target(
        &mut self,
        width: u32,
        height: u32,
        samples: u32,
    ) -> VulkanResult<TextureKey> {
        let sample_count = self.context.clamp_sample_count(samples);
        let texture = Texture::color_target(
            self.context.raw_device(),
            self.context.instance(),
            self.context.physical_device().device,
            vk::Extent2D { width, height },
            self.swapchain
                .as_ref()
                .map_or(vk::Format::B8G8R8A8_SRGB, |sc| sc.format().format),
            sample_count,
        )?;

        // Put the images into the layouts the first pass expects
        self.command_pool
            .submit_single_time(self.context.graphics_queue(), |dev, cmd| {
                cmd_transition_layout(
                    dev,
                    cmd,
                    texture.image(),
                    vk::ImageAspectFlags::COLOR,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
                if let Some(ms_image) = texture.multisample_image() {
                    cmd_transition_layout(
                        dev,
                        cmd,
                        ms_image,
                        vk::ImageAspectFlags::COLOR,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    );
                }
            })?;

        Ok(self.textures.insert(texture))
    }

    /// Create an offscreen depth target matching a color target's extent
    pub fn create_depth_texture(
        &mut self,
        width: u32,
        height: u32,
        samples: u32,
    ) -> VulkanResult<TextureKey> {
        let sample_count = self.context.clamp_sample_count(samples);
        let texture = Texture::depth_target(
            self.context.raw_device(),
            self.context.instance(),
            self.context.physical_device().device,
            vk::Extent2D { width, height },
            self.context.depth_format(),
            sample_count,
        )?;
        Ok(self.textures.insert(texture))
    }

    /// Destroy a texture. Fails while a camera still targets it or a
    /// material still samples it.
    pub fn destroy_texture(&mut self, key: TextureKey) -> VulkanResult<()> {
        if self
            .cameras
            .values()
            .any(|c| c.target_color() == Some(key) || c.target_depth() == Some(key))
        {
            return Err(VulkanError::InvalidOperation {
                reason: "Texture is still a camera render target".to_string(),
            });
        }
        // Recorded secondaries reference the texture's view through live
        // descriptor sets; the binding must be replaced first
        if self.materials.values().any(|m| m.references_texture(key)) {
            return Err(VulkanError::InvalidOperation {
                reason: "Texture is still bound to a material sampler".to_string(),
            });
        }
        self.context.wait_idle()?;
        self.textures.remove(key).ok_or_else(|| not_found(key))?;
        Ok(())
    }

    /// Look up a texture
    pub fn texture(&self, key: TextureKey) -> Option<&Texture> {
        self.textures.get(key)
    }

    // --- frame loop ---

    /// Pause rendering, e.g. while minimized. Idles the device so the caller
    /// may safely tear down platform state.
    pub fn on_pause(&mut self) -> VulkanResult<()> {
        self.context.wait_idle()?;
        self.paused = true;
        Ok(())
    }

    /// Resume rendering after a pause
    pub fn on_resume(&mut self) {
        self.paused = false;
        self.primary_cmd_dirty = true;
    }

    /// Whether the frame loop is paused
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Make the next submission wait on an externally signaled semaphore,
    /// consumed by that one frame
    pub fn set_compute_wait_semaphore(&mut self, semaphore: Option<vk::Semaphore>) {
        self.compute_wait = semaphore;
    }

    /// Consume every pending dirty flag: rebuild stale passes, flush material
    /// properties, re-record stale secondaries, then stale primaries.
    ///
    /// A frame with nothing dirty passes straight through.
    pub fn update(&mut self) -> VulkanResult<()> {
        let Self {
            cameras,
            camera_order,
            shaders,
            materials,
            renderers,
            textures,
            depth_texture,
            primary_cmds,
            primary_cmd_dirty,
            pipeline_cache,
            command_pool,
            swapchain,
            context,
            ..
        } = self;

        let Some(swapchain) = swapchain.as_ref() else {
            return Ok(());
        };
        let device = context.raw_device();
        let depth_view = depth_texture.view();
        let depth_format = depth_texture.format();

        // GPU idle is required once before any destruction or re-record;
        // a clean frame never pays for it
        let mut waited = false;
        let mut ensure_idle = |context: &VulkanContext| -> VulkanResult<()> {
            if !waited {
                context.wait_idle()?;
                waited = true;
            }
            Ok(())
        };

        // 1. Rebuild render passes, purging pipelines keyed by the old handle
        let mut freed_cmds: Vec<vk::CommandBuffer> = Vec::new();
        for &camera_key in camera_order.iter() {
            let Some(camera) = cameras.get_mut(camera_key) else {
                continue;
            };
            if !camera.dirty().contains(CameraDirty::RENDER_PASS) {
                continue;
            }
            ensure_idle(context)?;

            let (old_pass, old_framebuffers) = camera.take_pass();
            freed_cmds.extend(camera.take_secondaries());
            if let Some(pass) = &old_pass {
                for shader in shaders.values_mut() {
                    shader.on_render_pass_destroy(pass.handle());
                }
            }
            drop(old_framebuffers);
            drop(old_pass);

            let (pass, framebuffers) =
                build_pass_objects(&device, camera, swapchain, depth_view, depth_format, textures)?;
            camera.attach_pass(pass, framebuffers);
            camera.mark_all_instances_dirty();
            *primary_cmd_dirty = true;
        }
        command_pool.free(&freed_cmds);

        // 2. Flush dirty material properties; texture re-binds invalidate
        //    the commands of every renderer bound to the material
        let mut stale_materials: Vec<MaterialKey> = Vec::new();
        for (material_key, material) in materials.iter_mut() {
            if !material.any_uniform_dirty() && !material.any_texture_dirty() {
                continue;
            }
            // Mapped uniform writes and descriptor updates must not race a
            // frame still executing; on_draw has already fenced the previous
            // frame out, so this wait returns immediately there
            ensure_idle(context)?;
            let Some(shader) = shaders.get(material.shader()) else {
                continue;
            };
            let layout = shader.uniform_layout().clone();
            if material.update_uniform_sets(&device, &layout, textures)? {
                stale_materials.push(material_key);
            }
        }
        if !stale_materials.is_empty() {
            let bound: Vec<RendererKey> = renderers
                .iter()
                .filter(|(_, r)| r.material().is_some_and(|m| stale_materials.contains(&m)))
                .map(|(k, _)| k)
                .collect();
            for camera in cameras.values_mut() {
                for &renderer in &bound {
                    camera.mark_renderer_dirty(renderer);
                }
            }
        }

        // 3. Per camera: re-sort by material queue, re-record stale
        //    secondaries, fold clear-value changes into the primary
        for &camera_key in camera_order.iter() {
            let Some(camera) = cameras.get_mut(camera_key) else {
                continue;
            };

            if camera.dirty().contains(CameraDirty::RENDERER_ORDER) {
                // A live material keeps its queue position even if its
                // shader has been destroyed
                camera.sort_instances(|renderer_key| {
                    renderers
                        .get(renderer_key)
                        .and_then(|r| r.material())
                        .and_then(|mk| materials.get(mk))
                        .map(|m| m.resolved_queue(shaders.get(m.shader())))
                });
                *primary_cmd_dirty = true;
            }

            if camera.dirty().contains(CameraDirty::CLEAR_VALUES) {
                camera.clear_dirty(CameraDirty::CLEAR_VALUES);
                *primary_cmd_dirty = true;
            }

            if !camera.dirty().contains(CameraDirty::INSTANCE_CMDS) {
                continue;
            }
            ensure_idle(context)?;

            let (pass_handle, sample_count) = match camera.render_pass() {
                Some(pass) => (pass.handle(), pass.desc().sample_count),
                None => continue,
            };
            let extent = match camera.framebuffers().first() {
                Some(fb) => fb.extent(),
                None => continue,
            };
            let viewport_px = camera.viewport().to_pixels(extent.width, extent.height);

            for instance in camera.instances_mut() {
                if !instance.cmd_dirty {
                    continue;
                }
                let cmd = match instance.secondary_cmd {
                    Some(cmd) => cmd,
                    None => {
                        let cmd = command_pool.allocate_secondary()?;
                        instance.secondary_cmd = Some(cmd);
                        cmd
                    }
                };

                record_secondary(
                    &device,
                    cmd,
                    pass_handle,
                    sample_count,
                    viewport_px,
                    *pipeline_cache,
                    instance.renderer,
                    renderers,
                    materials,
                    shaders,
                )?;
                instance.cmd_dirty = false;
            }
            camera.clear_dirty(CameraDirty::INSTANCE_CMDS);
            *primary_cmd_dirty = true;
        }

        // 4. Rebuild primaries: one per swapchain image, each walking every
        //    camera's pass in depth order
        if *primary_cmd_dirty {
            ensure_idle(context)?;
            for (image_index, &cmd) in primary_cmds.iter().enumerate() {
                record_primary(&device, cmd, image_index, camera_order, cameras, textures)?;
            }
            *primary_cmd_dirty = false;
        }

        Ok(())
    }

    /// Run one frame: wait until the previous frame's work retires, apply
    /// pending updates, acquire, submit, present.
    pub fn on_draw(&mut self) -> VulkanResult<()> {
        if self.paused {
            return Ok(());
        }

        let frame = self.current_frame;
        // Fence signals retire in submission order, so once the previous
        // frame's fence signals no earlier submission still reads the mapped
        // uniform memory or recorded buffers update() is about to touch
        self.frame_syncs[previous_frame_slot(frame)]
            .in_flight
            .wait(u64::MAX)?;

        self.update()?;

        let compute_wait = self.compute_wait.take();
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(());
        };
        let sync = &self.frame_syncs[frame];

        let acquire = unsafe {
            swapchain.loader().acquire_next_image(
                swapchain.handle(),
                u64::MAX,
                sync.image_available.handle(),
                vk::Fence::null(),
            )
        };
        let image_index = match acquire {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                // A resize race, not a device fault; the pending resize
                // event rebuilds the swapchain
                log::debug!("Swapchain out of date on acquire, skipping frame");
                return Ok(());
            }
            Err(e) => return Err(VulkanError::Api(e)),
        };

        sync.in_flight.reset()?;

        let mut wait_semaphores = vec![sync.image_available.handle()];
        let mut wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        if let Some(semaphore) = compute_wait {
            wait_semaphores.push(semaphore);
            wait_stages.push(vk::PipelineStageFlags::VERTEX_INPUT);
        }
        let signal_semaphores = [sync.draw_complete.handle()];
        let command_buffers = [self.primary_cmds[image_index as usize]];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.context
                .raw_device()
                .queue_submit(
                    self.context.graphics_queue(),
                    &[submit_info.build()],
                    sync.in_flight.handle(),
                )
                .map_err(VulkanError::Api)?;
        }

        let swapchains = [swapchain.handle()];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let present = unsafe {
            swapchain
                .loader()
                .queue_present(self.context.present_queue(), &present_info)
        };
        match present {
            Ok(false) => {}
            Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                log::warn!("Swapchain suboptimal on present");
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                // Same resize race as on acquire; the image was already
                // submitted, so only presentation is lost
                log::debug!("Swapchain out of date on present");
            }
            Err(e) => return Err(VulkanError::Api(e)),
        }

        self.current_frame = (frame + 1) % FRAMES_IN_FLIGHT;
        Ok(())
    }

    /// React to a window resize: recreate the swapchain and the per-target
    /// state derived from its extent. A zero extent pauses rendering until
    /// the next non-zero resize.
    pub fn on_resize(&mut self, width: u32, height: u32) -> VulkanResult<()> {
        if width == 0 || height == 0 {
            log::debug!("Zero-sized framebuffer, pausing rendering");
            self.paused = true;
            return Ok(());
        }
        self.paused = false;

        self.context.wait_idle()?;
        let device = self.context.raw_device();

        let old = self.swapchain.take();
        let old_handle = old
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |s| s.handle());
        let swapchain = Swapchain::recreate(
            self.context.instance(),
            device.clone(),
            self.context.surface(),
            self.context.surface_loader(),
            self.context.physical_device(),
            vk::Extent2D { width, height },
            self.vsync,
            old_handle,
        )?;
        drop(old);

        self.depth_texture = Texture::depth_target(
            device,
            self.context.instance(),
            self.context.physical_device().device,
            swapchain.extent(),
            self.context.depth_format(),
            vk::SampleCountFlags::TYPE_1,
        )?;

        // Image count can change with the new surface capabilities
        self.command_pool.free(&self.primary_cmds);
        self.primary_cmds = self
            .command_pool
            .allocate_primary(swapchain.image_count() as u32)?;
        self.swapchain = Some(swapchain);

        for camera in self.cameras.values_mut() {
            if camera.targets_swapchain() {
                camera.mark_dirty(CameraDirty::RENDER_PASS);
            }
        }
        self.primary_cmd_dirty = true;

        log::info!("Resized to {}x{}", width, height);
        Ok(())
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        let _ = self.context.wait_idle();
        unsafe {
            self.context
                .raw_device()
                .destroy_pipeline_cache(self.pipeline_cache, None);
        }
        // Arenas, pools, and the swapchain drop in field order; the context
        // drops last.
    }
}

/// Build the render pass and framebuffers for a camera's current target
fn build_pass_objects(
    device: &Device,
    camera: &Camera,
    swapchain: &Swapchain,
    depth_view: vk::ImageView,
    depth_format: vk::Format,
    textures: &SlotMap<TextureKey, Texture>,
) -> VulkanResult<(RenderPass, Vec<Framebuffer>)> {
    if let Some(color_key) = camera.target_color() {
        let color = textures.get(color_key).ok_or_else(|| not_found(color_key))?;
        let depth = camera
            .target_depth()
            .map(|k| textures.get(k).ok_or_else(|| not_found(k)))
            .transpose()?;

        let desc = RenderTargetDesc {
            color_format: color.format(),
            depth_format: depth.map(|d| d.format()),
            sample_count: color.sample_count(),
            clear_flag: camera.clear_flag(),
            present: false,
        };
        let pass = RenderPass::new(device.clone(), desc)?;

        // Multisample targets render into the companion image; the primary
        // image receives the post-pass resolve
        let color_view = color.multisample_view().unwrap_or_else(|| color.view());
        let mut attachments = vec![color_view];
        if let Some(depth) = depth {
            attachments.push(depth.view());
        }
        let framebuffer =
            Framebuffer::new(device.clone(), pass.handle(), &attachments, color.extent())?;
        Ok((pass, vec![framebuffer]))
    } else {
        let desc = RenderTargetDesc {
            color_format: swapchain.format().format,
            depth_format: Some(depth_format),
            sample_count: vk::SampleCountFlags::TYPE_1,
            clear_flag: camera.clear_flag(),
            present: true,
        };
        let pass = RenderPass::new(device.clone(), desc)?;

        let framebuffers = swapchain
            .image_views()
            .iter()
            .map(|&view| {
                Framebuffer::new(
                    device.clone(),
                    pass.handle(),
                    &[view, depth_view],
                    swapchain.extent(),
                )
            })
            .collect::<VulkanResult<Vec<_>>>()?;
        Ok((pass, framebuffers))
    }
}

/// Record one renderer's draw into its secondary command buffer.
///
/// An unresolvable draw chain (no material, destroyed material or shader)
/// records an empty secondary rather than failing the frame.
#[allow(clippy::too_many_arguments)]
fn record_secondary(
    device: &Device,
    cmd: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    sample_count: vk::SampleCountFlags,
    viewport_px: crate::foundation::math::PixelRect,
    pipeline_cache: vk::PipelineCache,
    renderer_key: RendererKey,
    renderers: &SlotMap<RendererKey, Renderer>,
    materials: &SlotMap<MaterialKey, Material>,
    shaders: &mut SlotMap<ShaderKey, Shader>,
) -> VulkanResult<()> {
    let inheritance = vk::CommandBufferInheritanceInfo::builder()
        .render_pass(render_pass)
        .subpass(0);
    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(
            vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE
                | vk::CommandBufferUsageFlags::SIMULTANEOUS_USE,
        )
        .inheritance_info(&inheritance);

    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(VulkanError::Api)?;
    }

    let viewport = vk::Viewport {
        x: viewport_px.x as f32,
        y: viewport_px.y as f32,
        width: viewport_px.w as f32,
        height: viewport_px.h as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D {
            x: viewport_px.x,
            y: viewport_px.y,
        },
        extent: vk::Extent2D {
            width: viewport_px.w,
            height: viewport_px.h,
        },
    };
    unsafe {
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[scissor]);
    }

    let draw = renderers.get(renderer_key).and_then(|renderer| {
        let material = materials.get(renderer.material()?)?;
        Some((renderer, material))
    });
    if let Some((renderer, material)) = draw {
        if let Some(shader) = shaders.get_mut(material.shader()) {
            let pipeline = shader.get_pipeline(pipeline_cache, render_pass, sample_count)?;
            let descriptor_sets = [material.descriptor_set()];
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    shader.pipeline_layout(),
                    0,
                    &descriptor_sets,
                    &[],
                );
                device.cmd_bind_vertex_buffers(cmd, 0, &[renderer.vertex_buffer().handle()], &[0]);
                device.cmd_bind_index_buffer(
                    cmd,
                    renderer.index_buffer().handle(),
                    0,
                    renderer.index_buffer().index_type(),
                );
                device.cmd_draw_indexed(cmd, renderer.index_count(), 1, renderer.first_index(), 0, 0);
            }
        }
    }

    unsafe {
        device.end_command_buffer(cmd).map_err(VulkanError::Api)?;
    }
    Ok(())
}

/// Record one primary command buffer: every camera's pass in depth order,
/// executing the cached secondaries, with explicit post-pass resolves for
/// multisample offscreen targets
fn record_primary(
    device: &Device,
    cmd: vk::CommandBuffer,
    image_index: usize,
    camera_order: &[CameraKey],
    cameras: &SlotMap<CameraKey, Camera>,
    textures: &SlotMap<TextureKey, Texture>,
) -> VulkanResult<()> {
    let begin_info =
        vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);
    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(VulkanError::Api)?;
    }

    for &camera_key in camera_order {
        let Some(camera) = cameras.get(camera_key) else {
            continue;
        };
        let Some(pass) = camera.render_pass() else {
            continue;
        };
        let framebuffer = if camera.targets_swapchain() {
            camera.framebuffers().get(image_index)
        } else {
            camera.framebuffers().first()
        };
        let Some(framebuffer) = framebuffer else {
            continue;
        };

        let clear_values = camera.clear_values();
        let pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(pass.handle())
            .framebuffer(framebuffer.handle())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: framebuffer.extent(),
            })
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(
                cmd,
                &pass_begin,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            );
        }

        let secondaries: Vec<vk::CommandBuffer> = camera
            .instances()
            .iter()
            .filter_map(|instance| instance.secondary_cmd)
            .collect();
        if !secondaries.is_empty() {
            unsafe {
                device.cmd_execute_commands(cmd, &secondaries);
            }
        }

        unsafe {
            device.cmd_end_render_pass(cmd);
        }

        if let Some(color_key) = camera.target_color() {
            if let Some(texture) = textures.get(color_key) {
                if let Some(ms_image) = texture.multisample_image() {
                    record_msaa_resolve(device, cmd, ms_image, texture.image(), texture.extent());
                }
            }
        }
    }

    unsafe {
        device.end_command_buffer(cmd).map_err(VulkanError::Api)?;
    }
    Ok(())
}

/// Resolve a multisample offscreen image into its sampleable primary image
fn record_msaa_resolve(
    device: &Device,
    cmd: vk::CommandBuffer,
    ms_image: vk::Image,
    dst_image: vk::Image,
    extent: vk::Extent2D,
) {
    cmd_transition_layout(
        device,
        cmd,
        ms_image,
        vk::ImageAspectFlags::COLOR,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    );
    cmd_transition_layout(
        device,
        cmd,
        dst_image,
        vk::ImageAspectFlags::COLOR,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    );

    let subresource = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    let region = vk::ImageResolve {
        src_subresource: subresource,
        src_offset: vk::Offset3D::default(),
        dst_subresource: subresource,
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    };
    unsafe {
        device.cmd_resolve_image(
            cmd,
            ms_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }

    cmd_transition_layout(
        device,
        cmd,
        dst_image,
        vk::ImageAspectFlags::COLOR,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );
    cmd_transition_layout(
        device,
        cmd,
        ms_image,
        vk::ImageAspectFlags::COLOR,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previous_frame_slot_wraps() {
        assert_eq!(previous_frame_slot(0), FRAMES_IN_FLIGHT - 1);
        assert_eq!(previous_frame_slot(1), 0);
    }
}
