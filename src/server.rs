//! The server: lifecycle state machine and control surface.
//!
//! Callers drive the engine through a strict state sequence, mirrored in
//! [`ServerState`]:
//!
//! ```text
//! Init ──begin_app_specification──▶ AppSpec ──end_app_specification──▶
//! PlanGen ──begin_execution──▶ Exec ──stop / run-time elapsed──▶ End
//! ```
//!
//! Out-of-order calls fail with `InvalidUse`. `begin_execution` blocks on
//! the scheduler loop; a [`ServerHandle`] (cloneable, thread-safe) offers
//! `stop_execution` and hot monitor registration from other threads. A
//! monitor plan reads `SysStream` and is spliced in between scheduler
//! passes through the execution interlock.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog::TableCatalog;
use crate::config::{PAGE_SIZE, ServerParams};
use crate::error::RilletError;
use crate::exec::engine::Engine;
use crate::exec::memory::MemoryManager;
use crate::exec::runtime::Runtime;
use crate::exec::sched::{ExecControl, RoundRobinScheduler};
use crate::interface::{QueryOutput, TableSource};
use crate::plan::QueryPlan;
use crate::plan::graph;
use crate::plan::instantiate::{self, QueryInfo};
use crate::types::Attr;

/// Maximum queries registered per application.
pub const MAX_QUERIES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Init,
    AppSpec,
    PlanGen,
    Exec,
    End,
}

/// One registered (but not yet instantiated) query.
struct PendingQuery {
    plan: QueryPlan,
    output: Box<dyn QueryOutput>,
}

pub struct Server {
    state: ServerState,
    params: ServerParams,
    catalog: TableCatalog,
    pending: Vec<Option<PendingQuery>>,
    infos: Vec<Option<QueryInfo>>,
    engine: Option<Arc<Mutex<Engine>>>,
    control: Arc<ExecControl>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("queries", &self.pending.len())
            .finish()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            state: ServerState::Init,
            params: ServerParams::default(),
            catalog: TableCatalog::new(),
            pending: Vec::new(),
            infos: Vec::new(),
            engine: None,
            control: Arc::new(ExecControl::new()),
        }
    }

    fn expect_state(&self, expected: ServerState, what: &str) -> Result<(), RilletError> {
        if self.state != expected {
            return Err(RilletError::InvalidUse(format!(
                "{what} called in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Load engine parameters from a `key=value` file. Must precede
    /// `begin_app_specification`.
    pub fn set_config_file(&mut self, path: &Path) -> Result<(), RilletError> {
        self.expect_state(ServerState::Init, "set_config_file")?;
        self.params = ServerParams::from_file(path)?;
        Ok(())
    }

    pub fn params(&self) -> &ServerParams {
        &self.params
    }

    /// Set engine parameters directly (embedding API; the file-based
    /// front-ends go through [`Server::set_config_file`]).
    pub fn set_params(&mut self, params: ServerParams) -> Result<(), RilletError> {
        self.expect_state(ServerState::Init, "set_params")?;
        self.params = params;
        Ok(())
    }

    pub fn begin_app_specification(&mut self) -> Result<(), RilletError> {
        self.expect_state(ServerState::Init, "begin_app_specification")?;
        self.state = ServerState::AppSpec;
        Ok(())
    }

    /// Register a base stream or relation with its pull source.
    pub fn register_base_table(
        &mut self,
        name: &str,
        schema: Vec<Attr>,
        is_stream: bool,
        source: Box<dyn TableSource>,
    ) -> Result<usize, RilletError> {
        self.expect_state(ServerState::AppSpec, "register_base_table")?;
        self.catalog.register(name, schema, is_stream, source)
    }

    /// Register a continuous query as a compiled physical plan; returns
    /// its query id. The plan is validated now; instantiation happens at
    /// `end_app_specification`.
    pub fn register_query(
        &mut self,
        plan: QueryPlan,
        output: Box<dyn QueryOutput>,
    ) -> Result<usize, RilletError> {
        self.expect_state(ServerState::AppSpec, "register_query")?;
        if self.pending.len() == MAX_QUERIES {
            return Err(RilletError::InvalidParam(format!(
                "too many queries (max {MAX_QUERIES})"
            )));
        }
        graph::validate(&plan)?;
        let id = self.pending.len();
        self.pending.push(Some(PendingQuery { plan, output }));
        self.infos.push(None);
        Ok(id)
    }

    /// Output schema of a registered query.
    pub fn get_query_schema(&self, query_id: usize) -> Result<Vec<Attr>, RilletError> {
        if let Some(Some(info)) = self.infos.get(query_id) {
            return Ok(info.schema.clone());
        }
        match self.pending.get(query_id) {
            Some(Some(p)) => Ok(p.plan.nodes[p.plan.root].schema.clone()),
            _ => Err(RilletError::InvalidParam(format!(
                "unknown query id {query_id}"
            ))),
        }
    }

    /// Instantiate all registered queries into a fresh engine.
    pub fn end_app_specification(&mut self) -> Result<(), RilletError> {
        self.expect_state(ServerState::AppSpec, "end_app_specification")?;

        let mem = MemoryManager::new(self.params.memory_size, PAGE_SIZE);
        let mut engine = Engine::new(Runtime::new(mem));
        instantiate::install_sys_stream_gen(&mut engine);

        for (id, slot) in self.pending.iter_mut().enumerate() {
            let q = slot.take().ok_or_else(|| {
                RilletError::InternalError("query instantiated twice".into())
            })?;
            let info = instantiate::instantiate_query(
                &mut engine,
                &self.params,
                &mut self.catalog,
                &q.plan,
                q.output,
            )?;
            tracing::info!(query = id, ops = engine.num_ops(), "query instantiated");
            self.infos[id] = Some(info);
        }

        self.engine = Some(Arc::new(Mutex::new(engine)));
        self.state = ServerState::PlanGen;
        Ok(())
    }

    /// A cloneable handle for control threads. Available from `PlanGen`
    /// onward.
    pub fn handle(&self) -> Result<ServerHandle, RilletError> {
        let engine = self.engine.clone().ok_or_else(|| {
            RilletError::InvalidUse("handle requested before end_app_specification".into())
        })?;
        Ok(ServerHandle {
            engine,
            control: self.control.clone(),
            params: self.params.clone(),
        })
    }

    /// Run the scheduler for the configured `RUN_TIME` (0 = until
    /// stopped). Blocks the calling thread for the whole execution.
    pub fn begin_execution(&mut self) -> Result<(), RilletError> {
        self.expect_state(ServerState::PlanGen, "begin_execution")?;
        let engine = self.engine.clone().ok_or_else(|| {
            RilletError::InternalError("no engine after end_app_specification".into())
        })?;

        self.state = ServerState::Exec;
        let scheduler = RoundRobinScheduler::default();
        let result = scheduler.run(&engine, &self.control, self.params.run_time);
        self.state = ServerState::End;
        result
    }
}

/// Thread-safe control handle over a specified (or running) server.
#[derive(Clone)]
pub struct ServerHandle {
    engine: Arc<Mutex<Engine>>,
    control: Arc<ExecControl>,
    params: ServerParams,
}

impl ServerHandle {
    /// Request termination; the scheduler stops after its current pass.
    pub fn stop_execution(&self) {
        self.control.stop();
    }

    /// Hot-insert a monitor query over `SysStream` while the scheduler
    /// runs. The scheduler is parked between passes, the sub-plan is
    /// instantiated and attached to the system-stream generator, and the
    /// scheduler resumes.
    pub fn register_monitor(
        &self,
        plan: QueryPlan,
        output: Box<dyn QueryOutput>,
    ) -> Result<QueryInfo, RilletError> {
        let was_running = self.control.interrupt();
        let result = {
            let mut engine = self.engine.lock();
            // Monitor plans resolve tables against a bare catalog: only
            // SysStream is visible to them.
            let mut catalog = TableCatalog::new();
            instantiate::instantiate_query(
                &mut engine,
                &self.params,
                &mut catalog,
                &plan,
                output,
            )
        };
        if was_running {
            self.control.resume();
        }
        match &result {
            Ok(info) => tracing::info!(output_op = info.output_op, "monitor registered"),
            Err(e) => tracing::warn!(error = %e, "monitor registration failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::SourceRecord;
    use crate::plan::{PlanNode, PlanOpKind};
    use crate::types::AttrType;

    struct NullSource;
    impl TableSource for NullSource {
        fn start(&mut self) -> Result<(), RilletError> {
            Ok(())
        }
        fn get_next(&mut self) -> Result<Option<SourceRecord<'_>>, RilletError> {
            Ok(None)
        }
        fn end(&mut self) -> Result<(), RilletError> {
            Ok(())
        }
    }

    struct NullOutput;
    impl QueryOutput for NullOutput {
        fn set_num_attrs(&mut self, _n: usize) -> Result<(), RilletError> {
            Ok(())
        }
        fn set_attr_info(&mut self, _p: usize, _t: AttrType, _l: u32) -> Result<(), RilletError> {
            Ok(())
        }
        fn start(&mut self) -> Result<(), RilletError> {
            Ok(())
        }
        fn put_next(&mut self, _d: &[u8]) -> Result<(), RilletError> {
            Ok(())
        }
        fn end(&mut self) -> Result<(), RilletError> {
            Ok(())
        }
    }

    fn passthrough_plan() -> QueryPlan {
        QueryPlan {
            nodes: vec![PlanNode {
                kind: PlanOpKind::StreamSource { table: "S".into() },
                inputs: vec![],
                schema: vec![Attr::int()],
                is_stream: true,
            }],
            root: 0,
        }
    }

    #[test]
    fn test_state_machine_enforced() {
        let mut server = Server::new();
        assert!(matches!(
            server.register_base_table("S", vec![Attr::int()], true, Box::new(NullSource)),
            Err(RilletError::InvalidUse(_))
        ));
        server.begin_app_specification().unwrap();
        assert!(matches!(
            server.begin_app_specification(),
            Err(RilletError::InvalidUse(_))
        ));
        assert!(matches!(
            server.begin_execution(),
            Err(RilletError::InvalidUse(_))
        ));
    }

    #[test]
    fn test_full_lifecycle_with_run_time() {
        let mut server = Server::new();
        server.params.run_time = 2;
        server.begin_app_specification().unwrap();
        server
            .register_base_table("S", vec![Attr::int()], true, Box::new(NullSource))
            .unwrap();
        let qid = server
            .register_query(passthrough_plan(), Box::new(NullOutput))
            .unwrap();
        assert_eq!(server.get_query_schema(qid).unwrap(), vec![Attr::int()]);
        server.end_app_specification().unwrap();
        server.begin_execution().unwrap();
    }

    #[test]
    fn test_monitor_registration_while_stopped() {
        let mut server = Server::new();
        server.begin_app_specification().unwrap();
        server
            .register_base_table("S", vec![Attr::int()], true, Box::new(NullSource))
            .unwrap();
        server
            .register_query(passthrough_plan(), Box::new(NullOutput))
            .unwrap();
        server.end_app_specification().unwrap();

        let handle = server.handle().unwrap();
        let monitor_plan = QueryPlan {
            nodes: vec![PlanNode {
                kind: PlanOpKind::StreamSource { table: "SysStream".into() },
                inputs: vec![],
                schema: crate::exec::monitor::sys_stream_schema(),
                is_stream: true,
            }],
            root: 0,
        };
        let info = handle
            .register_monitor(monitor_plan, Box::new(NullOutput))
            .unwrap();
        assert!(info.output_op > 0);
    }

    #[test]
    fn test_unvalidated_query_rejected_at_registration() {
        let mut server = Server::new();
        server.begin_app_specification().unwrap();
        let bogus = QueryPlan { nodes: vec![], root: 0 };
        assert!(server.register_query(bogus, Box::new(NullOutput)).is_err());
    }
}
