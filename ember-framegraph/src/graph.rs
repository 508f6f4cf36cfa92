//! Frame graph assembly and execution.
//!
//! Passes are added with a build callback that declares the resources
//! the pass touches and a record callback that writes the actual
//! commands. [`FrameGraph::build`] runs the build callbacks, derives
//! ordering edges from [`ResourceDescriptor::Reference`] declarations,
//! schedules the passes and creates graph-owned resources.
//! [`FrameGraph::execute`] then records every scheduled pass into the
//! current frame command buffer with the barriers its declarations
//! imply.

use std::error::Error;
use std::fmt;

use ash::vk;
use ember_core::collections::SmallVec;
use ember_core::collections::hashmap::HashMap;
use ember_core::collections::hashset::HashSet;
use ember_core::log;
use ember_rhi::buffer::{Buffer, BufferDesc};
use ember_rhi::command::{
    CommandBuffer, color_attachment_info, depth_attachment_info, rendering_info,
};
use ember_rhi::device::Device;
use ember_rhi::error::RhiError;
use ember_rhi::execute::{
    BufferUse, ExecutionKind, TextureUse, execution_stage, transition_resources,
};
use ember_rhi::texture::{Texture, TextureDesc};

use crate::resource::{
    ResourceAccess, ResourceDescriptor, ResourceHandle, buffer_access_flags, texture_layout_access,
};
use crate::schedule::schedule;

#[derive(Debug)]
pub enum GraphError {
    /// No pass was marked as the root.
    MissingRootPass,
    /// More than one pass was marked as the root.
    MultipleRootPasses,
    /// A reference names a handle no pass declares.
    DanglingReference { pass: u32, handle: u32 },
    /// Two passes declare the same handle.
    DuplicateResource { handle: u32 },
    /// The reference edges form a cycle.
    Cycle,
    /// A graphics pass has no render area and no swapchain to take one
    /// from.
    MissingRenderArea { pass: u32 },
    /// A pass declares a swapchain attachment on a headless device.
    SwapchainUnavailable { pass: u32 },
    /// Creating a graph-owned resource failed.
    ResourceCreation(RhiError),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::MissingRootPass => write!(f, "no pass is marked as root"),
            GraphError::MultipleRootPasses => write!(f, "more than one pass is marked as root"),
            GraphError::DanglingReference { pass, handle } => {
                write!(f, "pass {pass} references undeclared resource {handle}")
            }
            GraphError::DuplicateResource { handle } => {
                write!(f, "resource {handle} is declared by more than one pass")
            }
            GraphError::Cycle => write!(f, "pass dependencies form a cycle"),
            GraphError::MissingRenderArea { pass } => {
                write!(f, "graphics pass {pass} has no render area")
            }
            GraphError::SwapchainUnavailable { pass } => {
                write!(f, "pass {pass} declares a swapchain attachment without a swapchain")
            }
            GraphError::ResourceCreation(_) => write!(f, "graph resource creation failed"),
        }
    }
}

impl Error for GraphError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GraphError::ResourceCreation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RhiError> for GraphError {
    fn from(err: RhiError) -> Self {
        GraphError::ResourceCreation(err)
    }
}

/// Passed to build callbacks to declare what the pass touches.
#[derive(Default)]
pub struct Builder {
    declarations: Vec<(ResourceHandle, ResourceDescriptor)>,
    render_area: Option<vk::Rect2D>,
}

impl Builder {
    pub fn declare(&mut self, handle: ResourceHandle, descriptor: ResourceDescriptor) {
        self.declarations.push((handle, descriptor));
    }

    /// Declares a read of a resource another pass produces.
    pub fn read(&mut self, handle: ResourceHandle) {
        self.declare(
            handle,
            ResourceDescriptor::Reference {
                handle,
                access: ResourceAccess::Read,
            },
        );
    }

    /// Declares a write to a resource another pass produces.
    pub fn write(&mut self, handle: ResourceHandle) {
        self.declare(
            handle,
            ResourceDescriptor::Reference {
                handle,
                access: ResourceAccess::Write,
            },
        );
    }

    pub fn read_write(&mut self, handle: ResourceHandle) {
        self.declare(
            handle,
            ResourceDescriptor::Reference {
                handle,
                access: ResourceAccess::ReadWrite,
            },
        );
    }

    /// Overrides the render area for a graphics pass. Defaults to the
    /// swapchain extent.
    pub fn set_render_area(&mut self, area: vk::Rect2D) {
        self.render_area = Some(area);
    }
}

#[derive(Default)]
struct ResourceTable {
    buffers: HashMap<u32, Buffer>,
    textures: HashMap<u32, Texture>,
}

/// Passed to record callbacks; resolves graph-owned resources and
/// exposes the frame command buffer.
pub struct PassContext<'a> {
    pub cmd: &'a mut CommandBuffer,
    resources: &'a ResourceTable,
}

impl PassContext<'_> {
    pub fn buffer(&self, handle: ResourceHandle) -> Option<&Buffer> {
        self.resources.buffers.get(&handle.0)
    }

    pub fn texture(&self, handle: ResourceHandle) -> Option<&Texture> {
        self.resources.textures.get(&handle.0)
    }
}

type BuildFn = Box<dyn FnMut(&mut Builder)>;
type RecordFn = Box<dyn FnMut(&mut PassContext<'_>)>;

struct PassNode {
    name: String,
    build: BuildFn,
    record: RecordFn,
    root: bool,
    declarations: Vec<(ResourceHandle, ResourceDescriptor)>,
    render_area: Option<vk::Rect2D>,
}

/// One resolved attachment of a graphics pass, built before the frame
/// command buffer is borrowed.
enum AttachmentPlan {
    Color {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        clear_value: vk::ClearValue,
    },
    Depth {
        view: vk::ImageView,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        clear_depth: f32,
    },
    Swapchain {
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        clear_value: vk::ClearValue,
    },
}

fn is_depth_layout(layout: vk::ImageLayout) -> bool {
    matches!(
        layout,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
            | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
    )
}

/// Which wrapper semantics a pass executes with, from its declarations.
fn execution_kind_for(
    has_attachment: bool,
    uses_shader_storage: bool,
    uses_indirect: bool,
) -> ExecutionKind {
    if has_attachment {
        ExecutionKind::Graphics
    } else if uses_shader_storage {
        if uses_indirect {
            ExecutionKind::ComputeIndirect
        } else {
            ExecutionKind::Compute
        }
    } else {
        ExecutionKind::Transfer
    }
}

/// Derives ordering edges and the root pass from per-pass declarations.
/// Returns `(edges, root)` with edges deduplicated.
fn plan_edges(
    passes: &[(Vec<(ResourceHandle, ResourceDescriptor)>, bool)],
) -> Result<(Vec<(u32, u32)>, Option<u32>), GraphError> {
    let mut producer: HashMap<u32, u32> = HashMap::default();
    for (index, (declarations, _)) in passes.iter().enumerate() {
        for (handle, descriptor) in declarations {
            if matches!(descriptor, ResourceDescriptor::Reference { .. }) {
                continue;
            }
            if producer.insert(handle.0, index as u32).is_some() {
                return Err(GraphError::DuplicateResource { handle: handle.0 });
            }
        }
    }

    let mut seen: HashSet<(u32, u32)> = HashSet::default();
    let mut edges = Vec::new();
    for (index, (declarations, _)) in passes.iter().enumerate() {
        for (_, descriptor) in declarations {
            let ResourceDescriptor::Reference { handle, .. } = descriptor else {
                continue;
            };
            let Some(&source) = producer.get(&handle.0) else {
                return Err(GraphError::DanglingReference {
                    pass: index as u32,
                    handle: handle.0,
                });
            };
            let edge = (source, index as u32);
            if source != index as u32 && seen.insert(edge) {
                edges.push(edge);
            }
        }
    }

    let mut root = None;
    for (index, (_, is_root)) in passes.iter().enumerate() {
        if *is_root {
            if root.is_some() {
                return Err(GraphError::MultipleRootPasses);
            }
            root = Some(index as u32);
        }
    }
    Ok((edges, root))
}

/// A rebuilt-per-frame graph of GPU passes.
#[derive(Default)]
pub struct FrameGraph {
    passes: Vec<PassNode>,
    order: Vec<u32>,
    resources: ResourceTable,
    built: bool,
}

impl FrameGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pass and returns its index. `root` marks the pass the
    /// schedule is rooted at; exactly one pass per graph must set it.
    pub fn add_pass(
        &mut self,
        name: &str,
        build: impl FnMut(&mut Builder) + 'static,
        record: impl FnMut(&mut PassContext<'_>) + 'static,
        root: bool,
    ) -> u32 {
        self.passes.push(PassNode {
            name: name.to_owned(),
            build: Box::new(build),
            record: Box::new(record),
            root,
            declarations: Vec::new(),
            render_area: None,
        });
        self.passes.len() as u32 - 1
    }

    /// Runs the build callbacks, schedules the passes and creates every
    /// graph-owned resource a scheduled pass declares.
    ///
    /// Resources from an earlier build are destroyed first, so a graph
    /// can be rebuilt (including after a failed build) without leaking.
    #[profiling::function]
    pub fn build(&mut self, device: &mut Device) -> Result<(), GraphError> {
        self.release(device);

        for pass in &mut self.passes {
            let mut builder = Builder::default();
            (pass.build)(&mut builder);
            pass.declarations = builder.declarations;
            pass.render_area = builder.render_area;
        }

        let planned: Vec<_> = self
            .passes
            .iter_mut()
            .map(|pass| (std::mem::take(&mut pass.declarations), pass.root))
            .collect();
        let (edges, root) = plan_edges(&planned)?;
        for (pass, (declarations, _)) in self.passes.iter_mut().zip(planned) {
            pass.declarations = declarations;
        }

        self.order = schedule(self.passes.len(), &edges, root)?;
        log::debug!(
            "frame graph scheduled {} of {} passes",
            self.order.len(),
            self.passes.len()
        );

        if let Err(err) = self.realize_resources(device) {
            // Resources created before the failure must not linger in
            // the table of a graph that reports itself unbuilt.
            self.release(device);
            return Err(err);
        }

        self.built = true;
        Ok(())
    }

    fn realize_resources(&mut self, device: &mut Device) -> Result<(), GraphError> {
        for &pass_index in &self.order {
            let pass = &self.passes[pass_index as usize];
            for (handle, descriptor) in &pass.declarations {
                match descriptor {
                    ResourceDescriptor::Buffer {
                        usage,
                        host_visible,
                        data,
                        size,
                        ..
                    } => {
                        let name = format!("{}/{}", pass.name, handle.0);
                        let buffer = device.create_buffer(&BufferDesc {
                            name: &name,
                            size: *size,
                            usage: *usage,
                            host_visible: *host_visible,
                            data: data.as_deref(),
                        })?;
                        self.resources.buffers.insert(handle.0, buffer);
                    }
                    ResourceDescriptor::Texture2D {
                        usage,
                        width,
                        height,
                        format,
                        filter,
                        wrap,
                        ..
                    } => {
                        let name = format!("{}/{}", pass.name, handle.0);
                        let desc = TextureDesc {
                            name: &name,
                            width: *width,
                            height: *height,
                            format: *format,
                            mip_count: 1,
                            filter: *filter,
                            wrap: *wrap,
                            data: None,
                        };
                        let texture = if usage.contains(vk::ImageUsageFlags::STORAGE) {
                            device.create_read_write_texture(&desc)?
                        } else {
                            device.create_texture_2d(&desc)?
                        };
                        self.resources.textures.insert(handle.0, texture);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Records every scheduled pass into the current frame command
    /// buffer. Must run between `begin_render_frame` and
    /// `end_render_frame`.
    #[profiling::function]
    pub fn execute(&mut self, device: &mut Device) -> Result<(), GraphError> {
        debug_assert!(self.built, "frame graph executed before build");

        for position in 0..self.order.len() {
            let pass_index = self.order[position] as usize;

            // Resolve declarations into barrier requests and attachment
            // plans before any command buffer borrow.
            let mut buffer_uses: SmallVec<[(u32, vk::AccessFlags2); 8]> = SmallVec::new();
            let mut texture_uses: SmallVec<[(u32, vk::ImageLayout, vk::AccessFlags2); 8]> =
                SmallVec::new();
            let mut attachments: SmallVec<[AttachmentPlan; 4]> = SmallVec::new();
            let mut uses_shader_storage = false;
            let mut uses_indirect = false;
            let mut wants_swapchain = false;

            for (handle, descriptor) in &self.passes[pass_index].declarations {
                match descriptor {
                    ResourceDescriptor::Buffer { usage, access, .. } => {
                        buffer_uses.push((handle.0, buffer_access_flags(*usage, *access)));
                        uses_shader_storage |= usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER);
                        uses_indirect |= usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER);
                    }
                    ResourceDescriptor::Texture2D { access, .. } => {
                        let (layout, flags) = texture_layout_access(*access);
                        texture_uses.push((handle.0, layout, flags));
                        uses_shader_storage = true;
                    }
                    ResourceDescriptor::Attachment {
                        view,
                        layout,
                        load_op,
                        store_op,
                        clear_value,
                    } => {
                        if is_depth_layout(*layout) {
                            // Safe: the clear value for a depth layout is
                            // written as depth_stencil by the declarer.
                            let clear_depth = unsafe { clear_value.depth_stencil.depth };
                            attachments.push(AttachmentPlan::Depth {
                                view: *view,
                                load_op: *load_op,
                                store_op: *store_op,
                                clear_depth,
                            });
                        } else {
                            attachments.push(AttachmentPlan::Color {
                                view: *view,
                                layout: *layout,
                                load_op: *load_op,
                                store_op: *store_op,
                                clear_value: *clear_value,
                            });
                        }
                    }
                    ResourceDescriptor::SwapchainAttachment {
                        load_op,
                        store_op,
                        clear_value,
                    } => {
                        wants_swapchain = true;
                        attachments.push(AttachmentPlan::Swapchain {
                            load_op: *load_op,
                            store_op: *store_op,
                            clear_value: *clear_value,
                        });
                    }
                    ResourceDescriptor::Reference { handle, access } => {
                        if let Some(buffer) = self.resources.buffers.get(&handle.0) {
                            buffer_uses.push((handle.0, buffer_access_flags(buffer.usage(), *access)));
                            uses_shader_storage |=
                                buffer.usage().contains(vk::BufferUsageFlags::STORAGE_BUFFER);
                            uses_indirect |= matches!(access, ResourceAccess::Read)
                                && buffer.usage().contains(vk::BufferUsageFlags::INDIRECT_BUFFER);
                        } else if self.resources.textures.contains_key(&handle.0) {
                            let (layout, flags) = texture_layout_access(*access);
                            texture_uses.push((handle.0, layout, flags));
                            uses_shader_storage = true;
                        }
                        // References to attachment-declared handles only
                        // order the passes; the image is synchronized by
                        // its owner.
                    }
                }
            }

            let kind =
                execution_kind_for(!attachments.is_empty(), uses_shader_storage, uses_indirect);

            // Snapshot the swapchain before borrowing the command buffer.
            let swapchain = device
                .swapchain()
                .map(|s| (s.current_texture().view(), s.extent()));
            if wants_swapchain && swapchain.is_none() {
                return Err(GraphError::SwapchainUnavailable {
                    pass: pass_index as u32,
                });
            }
            let render_area = self.passes[pass_index].render_area.or_else(|| {
                swapchain.map(|(_, extent)| vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                })
            });

            let cmd = device.frame_command_buffer_mut();

            // Pull the used resources out of the table so the wrapper
            // transition can borrow each of them mutably, then put them
            // back for the record callback.
            let mut held_buffers: SmallVec<[(u32, vk::AccessFlags2, Buffer); 8]> = buffer_uses
                .iter()
                .filter_map(|&(key, access)| {
                    self.resources
                        .buffers
                        .remove(&key)
                        .map(|buffer| (key, access, buffer))
                })
                .collect();
            let mut held_textures: SmallVec<[(u32, vk::ImageLayout, vk::AccessFlags2, Texture); 8]> =
                texture_uses
                    .iter()
                    .filter_map(|&(key, layout, access)| {
                        self.resources
                            .textures
                            .remove(&key)
                            .map(|texture| (key, layout, access, texture))
                    })
                    .collect();
            {
                let mut buffers: SmallVec<[BufferUse<'_>; 8]> = held_buffers
                    .iter_mut()
                    .map(|(_, access, buffer)| BufferUse {
                        buffer,
                        access: *access,
                    })
                    .collect();
                let mut textures: SmallVec<[TextureUse<'_>; 8]> = held_textures
                    .iter_mut()
                    .map(|(_, layout, access, texture)| TextureUse {
                        texture,
                        layout: *layout,
                        access: *access,
                    })
                    .collect();
                transition_resources(cmd, execution_stage(kind), &mut buffers, &mut textures);
            }
            for (key, _, buffer) in held_buffers.drain(..) {
                self.resources.buffers.insert(key, buffer);
            }
            for (key, _, _, texture) in held_textures.drain(..) {
                self.resources.textures.insert(key, texture);
            }

            let is_graphics = kind == ExecutionKind::Graphics;
            if is_graphics {
                let Some(render_area) = render_area else {
                    return Err(GraphError::MissingRenderArea {
                        pass: pass_index as u32,
                    });
                };

                let mut color_infos: SmallVec<[vk::RenderingAttachmentInfo<'_>; 4]> =
                    SmallVec::new();
                let mut depth_info = None;
                for plan in &attachments {
                    match plan {
                        AttachmentPlan::Color {
                            view,
                            layout,
                            load_op,
                            store_op,
                            clear_value,
                        } => color_infos.push(color_attachment_info(
                            *view,
                            *layout,
                            *load_op,
                            *store_op,
                            *clear_value,
                        )),
                        AttachmentPlan::Depth {
                            view,
                            load_op,
                            store_op,
                            clear_depth,
                        } => {
                            depth_info = Some(depth_attachment_info(
                                *view,
                                *load_op,
                                *store_op,
                                *clear_depth,
                            ));
                        }
                        AttachmentPlan::Swapchain {
                            load_op,
                            store_op,
                            clear_value,
                        } => {
                            // Presence checked above.
                            if let Some((view, _)) = swapchain {
                                color_infos.push(color_attachment_info(
                                    view,
                                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                                    *load_op,
                                    *store_op,
                                    *clear_value,
                                ));
                            }
                        }
                    }
                }
                let info = rendering_info(render_area, &color_infos, depth_info.as_ref());
                cmd.begin_rendering(&info);
            }

            let pass = &mut self.passes[pass_index];
            let mut context = PassContext {
                cmd,
                resources: &self.resources,
            };
            (pass.record)(&mut context);

            if is_graphics {
                cmd.end_rendering();
            }
        }
        Ok(())
    }

    /// Destroys every graph-owned resource and forgets the schedule.
    /// The pass list survives so the graph can be rebuilt.
    pub fn release(&mut self, device: &mut Device) {
        for (_, mut buffer) in self.resources.buffers.drain() {
            device.destroy_buffer(&mut buffer);
        }
        for (_, mut texture) in self.resources.textures.drain() {
            device.destroy_texture(&mut texture);
        }
        self.order.clear();
        self.built = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(handle: u32) -> (ResourceHandle, ResourceDescriptor) {
        (
            ResourceHandle(handle),
            ResourceDescriptor::Reference {
                handle: ResourceHandle(handle),
                access: ResourceAccess::Read,
            },
        )
    }

    fn owned_buffer(handle: u32) -> (ResourceHandle, ResourceDescriptor) {
        (
            ResourceHandle(handle),
            ResourceDescriptor::Buffer {
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                host_visible: false,
                data: None,
                size: 256,
                access: ResourceAccess::Write,
            },
        )
    }

    #[test]
    fn references_create_producer_edges() {
        let passes = vec![
            (vec![owned_buffer(7)], false),
            (vec![reference(7)], true),
        ];
        let (edges, root) = plan_edges(&passes).unwrap();
        assert_eq!(edges, vec![(0, 1)]);
        assert_eq!(root, Some(1));
    }

    #[test]
    fn duplicate_references_collapse_to_one_edge() {
        let passes = vec![
            (vec![owned_buffer(7)], false),
            (vec![reference(7), reference(7)], true),
        ];
        let (edges, _) = plan_edges(&passes).unwrap();
        assert_eq!(edges.len(), 1);
    }

    #[test]
    fn dangling_reference_is_fatal() {
        let passes = vec![(vec![reference(42)], true)];
        assert!(matches!(
            plan_edges(&passes),
            Err(GraphError::DanglingReference { pass: 0, handle: 42 })
        ));
    }

    #[test]
    fn duplicate_declaration_is_fatal() {
        let passes = vec![
            (vec![owned_buffer(7)], false),
            (vec![owned_buffer(7)], true),
        ];
        assert!(matches!(
            plan_edges(&passes),
            Err(GraphError::DuplicateResource { handle: 7 })
        ));
    }

    #[test]
    fn two_roots_are_fatal() {
        let passes: Vec<(Vec<(ResourceHandle, ResourceDescriptor)>, bool)> =
            vec![(vec![], true), (vec![], true)];
        assert!(matches!(
            plan_edges(&passes),
            Err(GraphError::MultipleRootPasses)
        ));
    }

    #[test]
    fn self_reference_adds_no_edge() {
        // A pass may re-declare its own output; that must not create a
        // cycle with itself.
        let passes = vec![(vec![owned_buffer(3), reference(3)], true)];
        let (edges, _) = plan_edges(&passes).unwrap();
        assert!(edges.is_empty());
    }

    #[test]
    fn kind_inference() {
        assert_eq!(
            execution_kind_for(true, true, true),
            ExecutionKind::Graphics
        );
        assert_eq!(
            execution_kind_for(false, true, false),
            ExecutionKind::Compute
        );
        assert_eq!(
            execution_kind_for(false, true, true),
            ExecutionKind::ComputeIndirect
        );
        assert_eq!(
            execution_kind_for(false, false, false),
            ExecutionKind::Transfer
        );
    }

    #[test]
    fn depth_layout_classification() {
        assert!(is_depth_layout(
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        ));
        assert!(!is_depth_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
    }
}
