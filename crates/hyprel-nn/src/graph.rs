//! Static hyper-relational graph arrays and per-mode edge planning.
//!
//! A hyper-relational statement is a triple `(s, r, o)` plus any number of
//! qualifier pairs `(qr, qv)`. The graph stores them as flat id arrays that
//! are built once and reused read-only by every forward pass:
//!
//! ```text
//! heads     = [s_0 .. s_E-1 | o_0 .. o_E-1]        forward | inverse
//! tails     = [o_0 .. o_E-1 | s_0 .. s_E-1]
//! edge_type = [r_0 .. r_E-1 | r_0+R .. r_E-1+R]
//!
//! qualifiers.relations = [qr_0 .. qr_Q-1 | qr_0 .. qr_Q-1]
//! qualifiers.entities  = [qv_0 .. qv_Q-1 | qv_0 .. qv_Q-1]
//! qualifiers.parents   = [p_0  .. p_Q-1  | p_0  .. p_Q-1 ]
//! ```
//!
//! An edge `(head, tail, rel)` carries a message from `tail` into `head`.
//! Parent indices are local to each half, so `parents[q]` names forward edge
//! `parents[q]` and inverse edge `parents[q] + E` alike.
//!
//! Edge plans are computed once per propagation mode; their index and
//! normalization tensors are uploaded once per device.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::error::{Error, Result};

/// A triple with its qualifier pairs, in vocabulary ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement {
    pub subject: u32,
    pub relation: u32,
    pub object: u32,
    /// `(qualifier relation, qualifier entity)` pairs.
    pub qualifiers: Vec<(u32, u32)>,
}

impl Statement {
    /// Create a statement without qualifiers.
    pub fn new(subject: u32, relation: u32, object: u32) -> Self {
        Self {
            subject,
            relation,
            object,
            qualifiers: Vec::new(),
        }
    }

    /// Attach a qualifier pair.
    pub fn with_qualifier(mut self, relation: u32, entity: u32) -> Self {
        self.qualifiers.push((relation, entity));
        self
    }
}

/// Qualifier columns, split into forward and inverse halves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualifierTable {
    pub relations: Vec<u32>,
    pub entities: Vec<u32>,
    /// Parent edge per qualifier, local to its half.
    pub parents: Vec<u32>,
}

impl QualifierTable {
    /// Total rows (2Q).
    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

type TensorCache = Mutex<Vec<(Propagation, Device, Arc<PlanTensors>)>>;

/// Edge and qualifier arrays of a hyper-relational graph.
#[derive(Debug)]
pub struct HyperRelGraph {
    num_entities: usize,
    num_relations: usize,
    heads: Vec<u32>,
    tails: Vec<u32>,
    edge_type: Vec<u32>,
    qualifiers: QualifierTable,
    plans: [OnceLock<EdgePlan>; 3],
    tensors: TensorCache,
}

impl Clone for HyperRelGraph {
    fn clone(&self) -> Self {
        Self {
            num_entities: self.num_entities,
            num_relations: self.num_relations,
            heads: self.heads.clone(),
            tails: self.tails.clone(),
            edge_type: self.edge_type.clone(),
            qualifiers: self.qualifiers.clone(),
            plans: self.plans.clone(),
            tensors: Mutex::default(),
        }
    }
}

impl HyperRelGraph {
    /// Build the forward/inverse arrays from statements.
    ///
    /// Qualifier pairs with relation id `0` are padding and are skipped.
    pub fn from_statements(
        statements: &[Statement],
        num_entities: usize,
        num_relations: usize,
    ) -> Result<Self> {
        let e = statements.len();
        let mut heads = Vec::with_capacity(2 * e);
        let mut tails = Vec::with_capacity(2 * e);
        let mut edge_type = Vec::with_capacity(2 * e);

        let mut q_rel = Vec::new();
        let mut q_ent = Vec::new();
        let mut q_par = Vec::new();

        for (i, st) in statements.iter().enumerate() {
            heads.push(st.subject);
            tails.push(st.object);
            edge_type.push(st.relation);
            for &(qr, qv) in &st.qualifiers {
                if qr == 0 {
                    continue;
                }
                q_rel.push(qr);
                q_ent.push(qv);
                q_par.push(i as u32);
            }
        }
        for st in statements {
            heads.push(st.object);
            tails.push(st.subject);
            edge_type.push(st.relation + num_relations as u32);
        }

        let qualifiers = QualifierTable {
            relations: [q_rel.as_slice(), q_rel.as_slice()].concat(),
            entities: [q_ent.as_slice(), q_ent.as_slice()].concat(),
            parents: [q_par.as_slice(), q_par.as_slice()].concat(),
        };

        Self::new(heads, tails, edge_type, qualifiers, num_entities, num_relations)
    }

    /// Wrap prebuilt arrays, checking the forward/inverse layout and id ranges.
    pub fn new(
        heads: Vec<u32>,
        tails: Vec<u32>,
        edge_type: Vec<u32>,
        qualifiers: QualifierTable,
        num_entities: usize,
        num_relations: usize,
    ) -> Result<Self> {
        if heads.len() != tails.len() || heads.len() != edge_type.len() {
            return Err(Error::InvalidGraph(format!(
                "edge arrays differ in length: {} heads, {} tails, {} types",
                heads.len(),
                tails.len(),
                edge_type.len()
            )));
        }
        if heads.len() % 2 != 0 || qualifiers.len() % 2 != 0 {
            return Err(Error::InvalidGraph(
                "edge and qualifier arrays must hold forward and inverse halves".into(),
            ));
        }
        let q_len = qualifiers.len();
        if qualifiers.entities.len() != q_len || qualifiers.parents.len() != q_len {
            return Err(Error::InvalidGraph("qualifier columns differ in length".into()));
        }

        let n = num_entities as u32;
        let mut entity_ids = heads.iter().chain(&tails).chain(&qualifiers.entities);
        if let Some(&bad) = entity_ids.find(|&&id| id >= n) {
            return Err(Error::InvalidGraph(format!(
                "entity id {bad} out of range for {num_entities} entities"
            )));
        }
        let r2 = 2 * num_relations as u32;
        if let Some(&bad) = edge_type.iter().find(|&&id| id >= r2) {
            return Err(Error::InvalidGraph(format!(
                "edge type {bad} out of range for {num_relations} relations"
            )));
        }
        if let Some(&bad) = qualifiers
            .relations
            .iter()
            .find(|&&id| id >= num_relations as u32)
        {
            return Err(Error::InvalidGraph(format!(
                "qualifier relation {bad} out of range for {num_relations} relations"
            )));
        }
        let e = (heads.len() / 2) as u32;
        if let Some(&bad) = qualifiers.parents.iter().find(|&&p| p >= e) {
            return Err(Error::InvalidGraph(format!(
                "qualifier parent {bad} out of range for {e} edges"
            )));
        }

        debug!(
            entities = num_entities,
            relations = num_relations,
            edges = heads.len(),
            qualifiers = qualifiers.len(),
            "built hyper-relational graph"
        );

        Ok(Self {
            num_entities,
            num_relations,
            heads,
            tails,
            edge_type,
            qualifiers,
            plans: Default::default(),
            tensors: Mutex::default(),
        })
    }

    pub fn num_entities(&self) -> usize {
        self.num_entities
    }

    pub fn num_relations(&self) -> usize {
        self.num_relations
    }

    /// Number of forward edges (E).
    pub fn num_edges(&self) -> usize {
        self.heads.len() / 2
    }

    /// Number of forward qualifier rows (Q).
    pub fn num_qualifiers(&self) -> usize {
        self.qualifiers.len() / 2
    }

    pub fn heads(&self) -> &[u32] {
        &self.heads
    }

    pub fn tails(&self) -> &[u32] {
        &self.tails
    }

    pub fn edge_type(&self) -> &[u32] {
        &self.edge_type
    }

    pub fn qualifiers(&self) -> &QualifierTable {
        &self.qualifiers
    }

    /// Edge groups for `propagation`, planned on first use and cached.
    pub fn plan(&self, propagation: Propagation) -> &EdgePlan {
        let slot = match propagation {
            Propagation::Triple => 0,
            Propagation::Qualifier => 1,
            Propagation::Both => 2,
        };
        self.plans[slot].get_or_init(|| plan_edges(self, propagation))
    }

    /// Device-side tensors of [`Self::plan`], uploaded on first use per device.
    pub fn plan_tensors(
        &self,
        propagation: Propagation,
        device: &Device,
    ) -> Result<Arc<PlanTensors>> {
        let mut cache = self.tensors.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, _, tensors)) = cache
            .iter()
            .find(|(p, d, _)| *p == propagation && d.same_device(device))
        {
            return Ok(Arc::clone(tensors));
        }

        let tensors = Arc::new(PlanTensors::new(
            self.plan(propagation),
            self.num_entities,
            device,
        )?);
        debug!(?propagation, ?device, "uploaded edge tensors");
        cache.push((propagation, device.clone(), Arc::clone(&tensors)));
        Ok(tensors)
    }
}

/// Which slice of the graph a convolution pass aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Propagation {
    /// Triple edges only.
    Triple,
    /// Qualifiers pooled into their triples; inverse edges run from qualifier
    /// entities to subjects.
    Qualifier,
    /// Qualifier entities linked directly to subjects, interpolated with the
    /// parent triple's relation.
    Both,
}

impl std::str::FromStr for Propagation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "triple" | "trip" => Ok(Propagation::Triple),
            "qualifier" | "qual" => Ok(Propagation::Qualifier),
            "both" => Ok(Propagation::Both),
            other => Err(Error::InvalidGraph(format!(
                "unknown propagation mode: {other}"
            ))),
        }
    }
}

/// Qualifier slice pooled into triples by parent index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledQualifiers {
    pub relations: Vec<u32>,
    pub entities: Vec<u32>,
    pub parents: Vec<u32>,
}

/// Parent-triple data carried on synthesized qualifier edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripleContext {
    pub relations: Vec<u32>,
    pub objects: Vec<u32>,
}

/// How messages along an edge group are formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `phi(x[tail], rel[edge])`.
    Direct,
    /// Per edge, the sum of `phi(x[qv], rel[qr])` over the edge's qualifiers.
    Pooled(PooledQualifiers),
    /// `alpha * phi(x[tail], rel[parent]) + (1 - alpha) * phi(x[tail], rel[edge])`.
    Interpolated(TripleContext),
}

/// One group of edges aggregated with a shared weight matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeGroup {
    pub heads: Vec<u32>,
    pub tails: Vec<u32>,
    /// Row of the relation table used per edge.
    pub relations: Vec<u32>,
    pub message: Message,
}

impl EdgeGroup {
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Degree normalization over this group.
    pub fn norm(&self, num_entities: usize) -> Vec<f32> {
        crate::norm::symmetric_norm(&self.heads, &self.tails, num_entities)
    }
}

/// Forward and inverse edge groups for one propagation mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgePlan {
    pub inward: EdgeGroup,
    pub outward: EdgeGroup,
}

/// Per-qualifier index tensors of [`PooledQualifiers`].
#[derive(Debug, Clone)]
pub struct PooledTensors {
    pub relations: Tensor,
    pub entities: Tensor,
    pub parents: Tensor,
    len: usize,
}

impl PooledTensors {
    pub fn new(pooled: &PooledQualifiers, device: &Device) -> Result<Self> {
        let len = pooled.parents.len();
        Ok(Self {
            relations: Tensor::from_slice(&pooled.relations, len, device)?,
            entities: Tensor::from_slice(&pooled.entities, len, device)?,
            parents: Tensor::from_slice(&pooled.parents, len, device)?,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Device-side counterpart of [`Message`].
#[derive(Debug, Clone)]
pub enum MessageTensors {
    Direct,
    Pooled(PooledTensors),
    /// Parent triple relation per edge.
    Interpolated { relations: Tensor },
}

/// Device-side counterpart of [`EdgeGroup`], with its normalization.
#[derive(Debug, Clone)]
pub struct GroupTensors {
    pub heads: Tensor,
    pub tails: Tensor,
    pub relations: Tensor,
    /// Degree normalization (M x 1, f32).
    pub norm: Tensor,
    pub message: MessageTensors,
    len: usize,
}

impl GroupTensors {
    pub fn new(group: &EdgeGroup, num_entities: usize, device: &Device) -> Result<Self> {
        let m = group.len();
        let message = match &group.message {
            Message::Direct => MessageTensors::Direct,
            Message::Pooled(pooled) => MessageTensors::Pooled(PooledTensors::new(pooled, device)?),
            Message::Interpolated(ctx) => MessageTensors::Interpolated {
                relations: Tensor::from_slice(&ctx.relations, m, device)?,
            },
        };
        Ok(Self {
            heads: Tensor::from_slice(&group.heads, m, device)?,
            tails: Tensor::from_slice(&group.tails, m, device)?,
            relations: Tensor::from_slice(&group.relations, m, device)?,
            norm: Tensor::from_vec(group.norm(num_entities), (m, 1), device)?,
            message,
            len: m,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Device-side counterpart of [`EdgePlan`].
#[derive(Debug, Clone)]
pub struct PlanTensors {
    pub inward: GroupTensors,
    pub outward: GroupTensors,
}

impl PlanTensors {
    pub fn new(plan: &EdgePlan, num_entities: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            inward: GroupTensors::new(&plan.inward, num_entities, device)?,
            outward: GroupTensors::new(&plan.outward, num_entities, device)?,
        })
    }
}

/// Split the graph into the forward and inverse groups for `propagation`.
pub fn plan_edges(graph: &HyperRelGraph, propagation: Propagation) -> EdgePlan {
    let e = graph.num_edges();
    let q = graph.num_qualifiers();
    let r = graph.num_relations() as u32;

    let (fwd_heads, inv_heads) = graph.heads.split_at(e);
    let (fwd_tails, inv_tails) = graph.tails.split_at(e);
    let (fwd_type, inv_type) = graph.edge_type.split_at(e);

    let quals = &graph.qualifiers;
    let fwd_qr = &quals.relations[..q];
    let fwd_qv = &quals.entities[..q];
    let fwd_qp = &quals.parents[..q];
    let inv_qr = &quals.relations[q..];
    let inv_qv = &quals.entities[q..];
    let inv_qp = &quals.parents[q..];

    let plan = match propagation {
        Propagation::Triple => EdgePlan {
            inward: EdgeGroup {
                heads: fwd_heads.to_vec(),
                tails: fwd_tails.to_vec(),
                relations: fwd_type.to_vec(),
                message: Message::Direct,
            },
            outward: EdgeGroup {
                heads: inv_heads.to_vec(),
                tails: inv_tails.to_vec(),
                relations: inv_type.to_vec(),
                message: Message::Direct,
            },
        },
        Propagation::Qualifier => EdgePlan {
            inward: EdgeGroup {
                heads: fwd_heads.to_vec(),
                tails: fwd_tails.to_vec(),
                relations: fwd_type.to_vec(),
                message: Message::Pooled(PooledQualifiers {
                    relations: fwd_qr.to_vec(),
                    entities: fwd_qv.to_vec(),
                    parents: fwd_qp.to_vec(),
                }),
            },
            outward: EdgeGroup {
                heads: inv_qv.to_vec(),
                tails: inv_qp.iter().map(|&p| fwd_heads[p as usize]).collect(),
                relations: inv_qr.iter().map(|&qr| qr + r).collect(),
                message: Message::Direct,
            },
        },
        Propagation::Both => {
            let context = |parents: &[u32]| TripleContext {
                relations: parents.iter().map(|&p| fwd_type[p as usize]).collect(),
                objects: parents.iter().map(|&p| fwd_tails[p as usize]).collect(),
            };
            EdgePlan {
                inward: EdgeGroup {
                    heads: fwd_qv.to_vec(),
                    tails: fwd_qp.iter().map(|&p| fwd_heads[p as usize]).collect(),
                    relations: fwd_qr.to_vec(),
                    message: Message::Interpolated(context(fwd_qp)),
                },
                outward: EdgeGroup {
                    heads: inv_qp.iter().map(|&p| fwd_heads[p as usize]).collect(),
                    tails: inv_qv.to_vec(),
                    relations: inv_qr.iter().map(|&qr| qr + r).collect(),
                    message: Message::Interpolated(context(inv_qp)),
                },
            }
        }
    };

    debug!(
        ?propagation,
        inward = plan.inward.len(),
        outward = plan.outward.len(),
        "planned edge groups"
    );
    plan
}
