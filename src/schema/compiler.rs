//! Streaming schema compiler.
//!
//! Consumes a schema document event by event. Opening a recognized tag
//! creates the corresponding live object bound to the output container
//! (groups immediately; fields once their shape is known at close), closing
//! a tag finalizes it: shape resolution runs explicit `<dimensions>` first,
//! then the source-declared shape, then literal-content inference. Fields
//! without a source write their literal content on the spot; sourced fields
//! enqueue a work item into the phase queue their strategy selects. Links
//! resolve in one pass when the `<definition>` root closes, through the
//! name-by-type table the group nodes accumulate.
//!
//! Unsupported tags are tolerated with a diagnostic and treated as
//! transparent wrappers; malformed shape declarations and unresolvable link
//! targets are fatal schema errors.

use super::element::{element_from_start, XmlElement};
use super::node::{NodeArena, NodeId};
use crate::container::{FieldOptions, GroupHandle};
use crate::error::{WriterError, WriterResult};
use crate::phase::{PhaseQueues, WorkItem};
use crate::source::{DataSource, SourceEnv};
use crate::types::{DataRecord, NxType, Rank, ScalarValue};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lifecycle point a field's value is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseMode {
    Init,
    Step,
    Final,
    Postrun,
}

impl PhaseMode {
    fn from_schema(tag: Option<&str>) -> WriterResult<PhaseMode> {
        match tag {
            None | Some("STEP") => Ok(PhaseMode::Step),
            Some("INIT") => Ok(PhaseMode::Init),
            Some("FINAL") => Ok(PhaseMode::Final),
            Some("POSTRUN") => Ok(PhaseMode::Postrun),
            Some(other) => Err(WriterError::Schema(format!(
                "unknown strategy mode '{}'",
                other
            ))),
        }
    }
}

/// Parsed `<strategy>` element.
#[derive(Clone, Debug)]
pub struct StrategySpec {
    pub mode: PhaseMode,
    pub trigger: Option<String>,
    /// 1-based growing axis of a STEP field.
    pub grows: Option<usize>,
    pub compression: Option<u32>,
    pub rate: Option<u8>,
    pub shuffle: bool,
    pub can_fail: bool,
}

impl Default for StrategySpec {
    fn default() -> Self {
        StrategySpec {
            mode: PhaseMode::Step,
            trigger: None,
            grows: None,
            compression: None,
            rate: None,
            shuffle: false,
            can_fail: false,
        }
    }
}

impl StrategySpec {
    fn from_element(el: &XmlElement) -> WriterResult<StrategySpec> {
        let compression = match el.attr("compression") {
            None | Some("false") => None,
            Some("true") => Some(1),
            Some(n) => Some(n.parse::<u32>().map_err(|_| {
                WriterError::Schema(format!("invalid compression filter '{}'", n))
            })?),
        };
        let parse_usize = |name: &str| -> WriterResult<Option<usize>> {
            el.attr(name)
                .map(|v| {
                    v.parse::<usize>().map_err(|_| {
                        WriterError::Schema(format!("invalid {} value '{}'", name, v))
                    })
                })
                .transpose()
        };
        Ok(StrategySpec {
            mode: PhaseMode::from_schema(el.attr("mode"))?,
            trigger: el.attr("trigger").map(str::to_string),
            grows: parse_usize("grows")?,
            compression,
            rate: parse_usize("rate")?.map(|r| r.min(9) as u8),
            shuffle: el.attr("shuffle") == Some("true"),
            can_fail: el.attr("canfail") == Some("true"),
        })
    }
}

struct AttrBuild {
    name: String,
    dtype: NxType,
    text: String,
}

struct DimsBuild {
    rank: usize,
    values: HashMap<usize, usize>,
}

struct FieldBuild {
    name: String,
    dtype: NxType,
    units: Option<String>,
    extra_attrs: Vec<(String, String)>,
    attrs: Vec<AttrBuild>,
    dims: Option<DimsBuild>,
    strategy: Option<StrategySpec>,
    source_elem: Option<XmlElement>,
    text: String,
    doc: Option<String>,
}

struct LinkSpec {
    owner: NodeId,
    name: String,
    target: String,
}

enum Open {
    Definition,
    Group(NodeId),
    Field(Box<FieldBuild>),
    Attribute(AttrBuild),
    Dimensions,
    Dim,
    Strategy,
    Link,
    Doc(String),
    Unknown,
}

/// The compiled form of one schema document.
pub struct CompiledSchema {
    pub arena: NodeArena,
    pub queues: PhaseQueues,
    /// Raw schema text, persisted into the configuration log.
    pub raw: String,
}

/// Streaming markup-to-node-tree compiler.
pub struct SchemaCompiler {
    env: SourceEnv,
}

struct Compilation<'e> {
    env: &'e SourceEnv,
    arena: NodeArena,
    stack: Vec<Open>,
    capture: Vec<XmlElement>,
    capturing: bool,
    links: Vec<LinkSpec>,
    group_attrs: HashMap<usize, Vec<AttrBuild>>,
    queues: PhaseQueues,
    seen_definition: bool,
}

impl SchemaCompiler {
    pub fn new(env: SourceEnv) -> Self {
        SchemaCompiler { env }
    }

    /// Compile a schema document against the container's root group.
    pub async fn compile(&self, xml: &str, root: GroupHandle) -> WriterResult<CompiledSchema> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut c = Compilation {
            env: &self.env,
            arena: NodeArena::new(root),
            stack: Vec::new(),
            capture: Vec::new(),
            capturing: false,
            links: Vec::new(),
            group_attrs: HashMap::new(),
            queues: PhaseQueues::default(),
            seen_definition: false,
        };
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => {
                    let el = element_from_start(&start)?;
                    c.handle_start(el)?;
                }
                Ok(Event::Empty(start)) => {
                    let el = element_from_start(&start)?;
                    c.handle_start(el)?;
                    c.handle_end().await?;
                }
                Ok(Event::Text(text)) => {
                    let chunk = text
                        .unescape()
                        .map_err(|e| WriterError::Schema(e.to_string()))?;
                    c.handle_text(&chunk);
                }
                Ok(Event::CData(data)) => {
                    let chunk = String::from_utf8_lossy(&data).into_owned();
                    c.handle_text(&chunk);
                }
                Ok(Event::End(_)) => c.handle_end().await?,
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(WriterError::Schema(e.to_string())),
            }
        }
        if !c.stack.is_empty() || c.capturing {
            return Err(WriterError::Schema(
                "unterminated element in schema document".to_string(),
            ));
        }
        if !c.seen_definition {
            return Err(WriterError::Schema(
                "schema document without a <definition> root".to_string(),
            ));
        }
        Ok(CompiledSchema {
            arena: c.arena,
            queues: c.queues,
            raw: xml.to_string(),
        })
    }
}

fn text_attr(value: &str) -> DataRecord {
    DataRecord::scalar(ScalarValue::Text(value.to_string()), NxType::Char)
}

/// Default group name for a class tag: `NXentry` opens as `entry`.
fn default_group_name(class: &str) -> String {
    class.strip_prefix("NX").unwrap_or(class).to_string()
}

impl<'e> Compilation<'e> {
    fn current_group(&self) -> NodeId {
        for open in self.stack.iter().rev() {
            if let Open::Group(id) = open {
                return *id;
            }
        }
        self.arena.root()
    }

    fn current_field_mut(&mut self) -> Option<&mut FieldBuild> {
        for open in self.stack.iter_mut().rev() {
            if let Open::Field(build) = open {
                return Some(build);
            }
        }
        None
    }

    fn in_field(&self) -> bool {
        self.stack.iter().any(|o| matches!(o, Open::Field(_)))
    }

    fn handle_start(&mut self, el: XmlElement) -> WriterResult<()> {
        if self.capturing {
            self.capture.push(el);
            return Ok(());
        }
        match el.tag.as_str() {
            "definition" => {
                self.seen_definition = true;
                self.stack.push(Open::Definition);
            }
            "group" => {
                let class = el.attr("type").ok_or_else(|| {
                    WriterError::Schema("group element without a type".to_string())
                })?;
                let name = el
                    .attr("name")
                    .map(str::to_string)
                    .unwrap_or_else(|| default_group_name(class));
                if name.is_empty() {
                    return Err(WriterError::Schema(format!(
                        "group of type '{}' has no usable name",
                        class
                    )));
                }
                let parent = self.current_group();
                let parent_handle = self.arena.get(parent).group.clone().ok_or_else(|| {
                    WriterError::Schema("parent group is not bound to the container".to_string())
                })?;
                let handle = parent_handle.create_group(&name, class)?;
                handle.set_attribute("NX_class", &text_attr(class))?;
                for (key, value) in &el.attrs {
                    if key != "name" && key != "type" {
                        handle.set_attribute(key, &text_attr(value))?;
                    }
                }
                let id = self.arena.add_group(parent, &name, class, handle);
                self.stack.push(Open::Group(id));
            }
            "field" => {
                let name = el.attr("name").ok_or_else(|| {
                    WriterError::Schema("field element without a name".to_string())
                })?;
                let dtype = match el.attr("type") {
                    Some(t) => NxType::from_schema_name(t).ok_or_else(|| {
                        WriterError::Schema(format!(
                            "unknown type '{}' on field '{}'",
                            t, name
                        ))
                    })?,
                    None => NxType::Char,
                };
                let extra_attrs = el
                    .attrs
                    .iter()
                    .filter(|(k, _)| !matches!(k.as_str(), "name" | "type" | "units"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.stack.push(Open::Field(Box::new(FieldBuild {
                    name: name.to_string(),
                    dtype,
                    units: el.attr("units").map(str::to_string),
                    extra_attrs,
                    attrs: Vec::new(),
                    dims: None,
                    strategy: None,
                    source_elem: None,
                    text: String::new(),
                    doc: None,
                })));
            }
            "attribute" => {
                let name = el.attr("name").ok_or_else(|| {
                    WriterError::Schema("attribute element without a name".to_string())
                })?;
                let dtype = match el.attr("type") {
                    Some(t) => NxType::from_schema_name(t).ok_or_else(|| {
                        WriterError::Schema(format!(
                            "unknown type '{}' on attribute '{}'",
                            t, name
                        ))
                    })?,
                    None => NxType::Char,
                };
                self.stack.push(Open::Attribute(AttrBuild {
                    name: name.to_string(),
                    dtype,
                    text: String::new(),
                }));
            }
            "datasource" => {
                if self.in_field() {
                    self.capturing = true;
                    self.capture.push(el);
                } else {
                    log::warn!("datasource outside a field is not supported; ignoring");
                    self.stack.push(Open::Unknown);
                }
            }
            "dimensions" => {
                let rank = el
                    .attr("rank")
                    .and_then(|r| r.parse::<usize>().ok())
                    .ok_or_else(|| {
                        WriterError::Schema("dimensions element without a valid rank".to_string())
                    })?;
                match self.current_field_mut() {
                    Some(field) => {
                        field.dims = Some(DimsBuild {
                            rank,
                            values: HashMap::new(),
                        })
                    }
                    None => log::warn!("dimensions outside a field; ignoring"),
                }
                self.stack.push(Open::Dimensions);
            }
            "dim" => {
                let index = el.attr("index").and_then(|i| i.parse::<usize>().ok());
                let value = el.attr("value").and_then(|v| v.parse::<usize>().ok());
                if let (Some(index), Some(field)) = (index, self.current_field_mut()) {
                    if let Some(dims) = field.dims.as_mut() {
                        if let Some(value) = value {
                            dims.values.insert(index, value);
                        }
                    }
                } else {
                    log::warn!("dim element outside dimensions; ignoring");
                }
                self.stack.push(Open::Dim);
            }
            "strategy" => {
                let spec = StrategySpec::from_element(&el)?;
                match self.current_field_mut() {
                    Some(field) => field.strategy = Some(spec),
                    None => log::warn!("strategy outside a field; ignoring"),
                }
                self.stack.push(Open::Strategy);
            }
            "link" => {
                let name = el.attr("name").ok_or_else(|| {
                    WriterError::Schema("link element without a name".to_string())
                })?;
                let target = el.attr("target").ok_or_else(|| {
                    WriterError::Schema(format!("link '{}' without a target", name))
                })?;
                self.links.push(LinkSpec {
                    owner: self.current_group(),
                    name: name.to_string(),
                    target: target.to_string(),
                });
                self.stack.push(Open::Link);
            }
            "doc" => self.stack.push(Open::Doc(String::new())),
            other => {
                log::warn!("unsupported schema tag '{}'; contents are still processed", other);
                self.stack.push(Open::Unknown);
            }
        }
        Ok(())
    }

    fn handle_text(&mut self, chunk: &str) {
        if self.capturing {
            if let Some(top) = self.capture.last_mut() {
                if !top.text.is_empty() {
                    top.text.push('\n');
                }
                top.text.push_str(chunk.trim());
            }
            return;
        }
        match self.stack.last_mut() {
            Some(Open::Field(build)) => {
                if !build.text.is_empty() {
                    build.text.push('\n');
                }
                build.text.push_str(chunk.trim());
            }
            Some(Open::Attribute(attr)) => attr.text.push_str(chunk.trim()),
            Some(Open::Doc(buf)) => {
                if !buf.is_empty() {
                    buf.push('\n');
                }
                buf.push_str(chunk.trim());
            }
            _ => {}
        }
    }

    async fn handle_end(&mut self) -> WriterResult<()> {
        if self.capturing {
            let el = self.capture.pop().ok_or_else(|| {
                WriterError::Schema("unbalanced datasource markup".to_string())
            })?;
            if let Some(parent) = self.capture.last_mut() {
                parent.children.push(el);
            } else {
                self.capturing = false;
                if let Some(field) = self.current_field_mut() {
                    if field.source_elem.is_some() {
                        log::warn!(
                            "field '{}' declares several datasources; the last one wins",
                            field.name
                        );
                    }
                    field.source_elem = Some(el);
                }
            }
            return Ok(());
        }
        let open = self.stack.pop().ok_or_else(|| {
            WriterError::Schema("unbalanced close tag in schema document".to_string())
        })?;
        match open {
            Open::Definition => self.resolve_links()?,
            Open::Group(id) => self.finalize_group(id)?,
            Open::Field(build) => self.finalize_field(*build).await?,
            Open::Attribute(attr) => self.attach_attribute(attr),
            Open::Doc(buf) => self.attach_doc(buf),
            Open::Dimensions | Open::Dim | Open::Strategy | Open::Link | Open::Unknown => {}
        }
        Ok(())
    }

    fn attach_attribute(&mut self, attr: AttrBuild) {
        if let Some(field) = self.current_field_mut() {
            field.attrs.push(attr);
            return;
        }
        let group = self.current_group();
        self.group_attrs.entry(group.0).or_default().push(attr);
    }

    fn attach_doc(&mut self, buf: String) {
        if let Some(field) = self.current_field_mut() {
            field.doc = Some(buf);
            return;
        }
        let group = self.current_group();
        self.arena.get_mut(group).doc = Some(buf);
    }

    /// Materialize a group's batched attributes in one pass; a repeated name
    /// resolves to the last sibling seen.
    fn finalize_group(&mut self, id: NodeId) -> WriterResult<()> {
        let Some(pending) = self.group_attrs.remove(&id.0) else {
            return Ok(());
        };
        let handle = self.arena.get(id).group.clone().ok_or_else(|| {
            WriterError::Schema("group is not bound to the container".to_string())
        })?;
        for (name, record) in merge_attributes(pending, &self.arena.get(id).name)? {
            handle.set_attribute(&name, &record)?;
        }
        Ok(())
    }

    async fn finalize_field(&mut self, build: FieldBuild) -> WriterResult<()> {
        let parent = self.current_group();
        let parent_handle = self.arena.get(parent).group.clone().ok_or_else(|| {
            WriterError::Schema("parent group is not bound to the container".to_string())
        })?;

        let strategy = build.strategy.clone().unwrap_or_default();

        // The source is built first: its declared shape is one of the
        // inference inputs. A can-fail field survives a failed setup; its
        // fetches then fail per phase and are masked with the sentinel.
        let mut source: Option<Box<dyn DataSource>> = None;
        if let Some(elem) = &build.source_elem {
            let kind = elem.attr("type").ok_or_else(|| {
                WriterError::Schema(format!(
                    "datasource for field '{}' without a type",
                    build.name
                ))
            })?;
            let mut s = self.env.pool.create(kind)?;
            match s.setup(elem, self.env).await {
                Ok(()) => source = Some(s),
                Err(err) if strategy.can_fail => {
                    log::warn!(
                        "source for field '{}' failed setup ({}); its values will be sentinel-filled",
                        build.name,
                        err
                    );
                    source = Some(Box::new(BrokenSource {
                        message: err.to_string(),
                    }));
                }
                Err(err) => return Err(err),
            }
        }

        // Shape resolution: explicit dims, then source-declared shape, then
        // literal content.
        let literal = build.text.trim().to_string();
        let mut literal_record: Option<DataRecord> = None;
        let declared: Vec<usize> = if let Some(dims) = &build.dims {
            let mut shape = Vec::with_capacity(dims.rank);
            let mut missing = false;
            for index in 1..=dims.rank {
                match dims.values.get(&index) {
                    Some(v) => shape.push(*v),
                    None => {
                        missing = true;
                        shape.push(0);
                    }
                }
            }
            if missing && strategy.mode != PhaseMode::Postrun {
                return Err(WriterError::Schema(format!(
                    "ambiguous dimensions for field '{}'",
                    build.name
                )));
            }
            if missing {
                log::warn!(
                    "field '{}' has an ambiguous rank-{} shape; falling back to zero extents",
                    build.name,
                    dims.rank
                );
            }
            shape
        } else if let Some((_, shape)) = source.as_ref().and_then(|s| s.declared_shape()) {
            shape
        } else if source.is_none() && !literal.is_empty() {
            let record = DataRecord::from_literal(&literal, build.dtype)?;
            let shape = record.shape.clone();
            literal_record = Some(record);
            shape
        } else {
            Vec::new()
        };
        let rank = Rank::from_ndim(declared.len()).ok_or_else(|| {
            WriterError::Schema(format!(
                "field '{}' declares unsupported rank {}",
                build.name,
                declared.len()
            ))
        })?;

        // STEP fields with a source grow along the strategy's axis; the
        // dataset gains one dimension with zero initial extent.
        let growing = source.is_some() && strategy.mode == PhaseMode::Step;
        let (create_shape, unlimited) = if growing {
            let axis = strategy.grows.unwrap_or(1);
            if axis == 0 || axis > declared.len() + 1 {
                return Err(WriterError::Schema(format!(
                    "grows axis {} out of range for field '{}'",
                    axis, build.name
                )));
            }
            let axis = axis - 1;
            let mut shape = declared.clone();
            shape.insert(axis, 0);
            (shape, Some(axis))
        } else {
            (declared.clone(), None)
        };

        let opts = FieldOptions {
            compression: strategy.compression,
            rate: strategy.rate,
            shuffle: strategy.shuffle,
        };
        let field = parent_handle.create_field(&build.name, build.dtype, &create_shape, unlimited, &opts)?;

        // Immediate attributes from the tag itself.
        field.set_attribute("type", &text_attr(build.dtype.schema_name()))?;
        if let Some(units) = &build.units {
            field.set_attribute("units", &text_attr(units))?;
        }
        for (key, value) in &build.extra_attrs {
            field.set_attribute(key, &text_attr(value))?;
        }
        // Batched sibling attributes, in one pass.
        for (name, record) in merge_attributes(build.attrs, &build.name)? {
            field.set_attribute(&name, &record)?;
        }

        let id = self.arena.add_field(parent, &build.name, field.clone());
        if let Some(doc) = build.doc {
            self.arena.get_mut(id).doc = Some(doc);
        }

        match source {
            None if strategy.mode == PhaseMode::Postrun => {
                // A deferred field: the literal is a reference string, not
                // data, and is written as an attribute when the entry closes.
                self.queues.postrun.push(Arc::new(Mutex::new(WorkItem {
                    name: field.path(),
                    field,
                    source: None,
                    dtype: build.dtype,
                    rank,
                    shape: declared,
                    grows: None,
                    can_fail: strategy.can_fail,
                    postrun_text: Some(literal),
                })));
            }
            None => {
                if let Some(record) = literal_record.take() {
                    field.write(&record.cast_to(build.dtype)?)?;
                } else if !literal.is_empty() {
                    let record = DataRecord::from_literal(&literal, build.dtype)?;
                    field.write(&record.cast_to(build.dtype)?)?;
                } else {
                    log::debug!("field '{}' has neither source nor content", build.name);
                }
            }
            Some(src) => {
                let item = Arc::new(Mutex::new(WorkItem {
                    name: field.path(),
                    field,
                    source: Some(src),
                    dtype: build.dtype,
                    rank,
                    shape: declared,
                    grows: unlimited,
                    can_fail: strategy.can_fail,
                    postrun_text: None,
                }));
                match strategy.mode {
                    PhaseMode::Init => self.queues.init.push(item),
                    PhaseMode::Step => match &strategy.trigger {
                        Some(trigger) => self
                            .queues
                            .triggers
                            .entry(trigger.clone())
                            .or_default()
                            .push(item),
                        None => self.queues.step.push(item),
                    },
                    PhaseMode::Final => self.queues.finals.push(item),
                    PhaseMode::Postrun => self.queues.postrun.push(item),
                }
            }
        }
        Ok(())
    }

    /// Resolve every link against the name-by-type table in one pass at
    /// definition close, so targets may reference groups declared later in
    /// the document.
    fn resolve_links(&mut self) -> WriterResult<()> {
        let links = std::mem::take(&mut self.links);
        for link in links {
            let segments: Vec<&str> = link.target.split('/').filter(|s| !s.is_empty()).collect();
            if segments.is_empty() {
                return Err(WriterError::Schema(format!(
                    "link '{}' has an empty target",
                    link.name
                )));
            }
            let mut current = self.arena.root();
            let mut resolved = String::new();
            for (i, segment) in segments.iter().enumerate() {
                let last = i + 1 == segments.len();
                let node = self.arena.get(current);
                let child = if segment.starts_with("NX") {
                    node.groups_by_class.get(*segment).copied()
                } else {
                    node.groups_by_name.get(*segment).copied()
                };
                match child {
                    Some(id) => {
                        resolved.push('/');
                        resolved.push_str(&self.arena.get(id).name);
                        current = id;
                    }
                    None if last => {
                        // Leaf: a field (or attribute) under the current
                        // group, addressed by name.
                        resolved.push('/');
                        resolved.push_str(segment);
                    }
                    None => {
                        return Err(WriterError::Schema(format!(
                            "link '{}' references '{}', which resolves to nothing",
                            link.name, segment
                        )));
                    }
                }
            }
            let owner = self.arena.get(link.owner).group.clone().ok_or_else(|| {
                WriterError::Schema("link owner is not bound to the container".to_string())
            })?;
            owner.create_link(&link.name, &resolved)?;
        }
        Ok(())
    }
}

/// Stand-in for a can-fail source whose setup failed: every fetch reports
/// the original setup error, which the phase engine masks with the sentinel.
struct BrokenSource {
    message: String,
}

#[async_trait::async_trait]
impl DataSource for BrokenSource {
    async fn setup(
        &mut self,
        _config: &XmlElement,
        _env: &SourceEnv,
    ) -> WriterResult<()> {
        Ok(())
    }

    async fn get_data(
        &mut self,
        _ctx: &crate::source::FetchContext,
    ) -> WriterResult<Option<DataRecord>> {
        Err(WriterError::SourceSetup(self.message.clone()))
    }

    fn is_valid(&self) -> bool {
        false
    }
}

/// Merge batched attributes into their final set: repeated names resolve to
/// the last sibling seen (kept, observed incidental behavior).
fn merge_attributes(
    pending: Vec<AttrBuild>,
    owner: &str,
) -> WriterResult<Vec<(String, DataRecord)>> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, DataRecord> = HashMap::new();
    for attr in pending {
        let record = if attr.text.trim().is_empty() {
            DataRecord::scalar(ScalarValue::Text(String::new()), NxType::Char)
        } else {
            DataRecord::from_literal(attr.text.trim(), attr.dtype)?
        };
        if merged.insert(attr.name.clone(), record).is_some() {
            log::debug!(
                "attribute '{}' on '{}' redefined; last value wins",
                attr.name,
                owner
            );
        } else {
            order.push(attr.name);
        }
    }
    Ok(order
        .into_iter()
        .filter_map(|name| merged.remove(&name).map(|r| (name, r)))
        .collect())
}
