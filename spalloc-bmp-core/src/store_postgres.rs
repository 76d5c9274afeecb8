use crate::error::{StoreError, StoreResult};
use crate::model::*;
use crate::store::Store;
use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Map a sqlx error onto the controller's classification: lock contention
/// and serialization failures become `Busy` (the tick is skipped and retried
/// next period), everything else propagates.
fn map_err(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if let Some(code) = db.code() {
            // serialization_failure, deadlock_detected, lock_not_available
            if matches!(code.as_ref(), "40001" | "40P01" | "55P03") {
                return StoreError::Busy;
            }
        }
    }
    StoreError::Backend(anyhow::Error::new(e))
}

fn link_flags_from_row(row: &PgRow) -> Result<LinkFlags, sqlx::Error> {
    let mut flags = LinkFlags::ALL_ON;
    for (col, direction) in [
        ("keep_n", Direction::North),
        ("keep_ne", Direction::NorthEast),
        ("keep_e", Direction::East),
        ("keep_s", Direction::South),
        ("keep_sw", Direction::SouthWest),
        ("keep_w", Direction::West),
    ] {
        flags.set(direction, row.try_get::<bool, _>(col)?);
    }
    Ok(flags)
}

fn parse_address(text: Option<String>) -> Option<IpAddr> {
    text.and_then(|s| s.parse().ok())
}

fn epoch_ms(ts: Option<chrono::DateTime<chrono::Utc>>) -> Option<Timestamp> {
    ts.map(|t| t.timestamp_millis())
}

/// PostgreSQL-backed implementation of `Store`. Every trait method is one
/// transaction; composite taking and applying stays atomic that way.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run BMP controller migrations")?;
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Transaction<'_, Postgres>> {
        self.pool.begin().await.map_err(map_err)
    }

    async fn set_job_state(
        tx: &mut Transaction<'_, Postgres>,
        job: JobId,
        state: JobState,
    ) -> StoreResult<bool> {
        let updated = sqlx::query("UPDATE jobs SET job_state = $2 WHERE job_id = $1 AND job_state <> $2")
            .bind(job)
            .bind(state.as_i16())
            .execute(&mut **tx)
            .await
            .map_err(map_err)?;
        Ok(updated.rows_affected() > 0)
    }

    async fn deallocate_job(tx: &mut Transaction<'_, Postgres>, job: JobId) -> StoreResult<()> {
        sqlx::query("UPDATE boards SET allocated_job = NULL WHERE allocated_job = $1")
            .bind(job)
            .execute(&mut **tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn mark_dead(
        tx: &mut Transaction<'_, Postgres>,
        board: BoardId,
        reporter: &str,
        issue: &str,
    ) -> StoreResult<bool> {
        let updated =
            sqlx::query("UPDATE boards SET functioning = FALSE WHERE board_id = $1 AND functioning")
                .bind(board)
                .execute(&mut **tx)
                .await
                .map_err(map_err)?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO board_reports (board_id, reporter, reported_issue) VALUES ($1, $2, $3)",
        )
        .bind(board)
        .bind(reporter)
        .bind(issue)
        .execute(&mut **tx)
        .await
        .map_err(map_err)?;
        Ok(true)
    }
}

#[async_trait]
impl Store for PostgresStore {
    // ── Machines ──

    async fn machines(&self) -> StoreResult<Vec<MachineDesc>> {
        let machine_rows = sqlx::query("SELECT machine_name, in_service FROM machines")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        let bmp_rows =
            sqlx::query("SELECT machine_name, cabinet, frame, address FROM bmps")
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;

        let mut bmps_by_machine: BTreeMap<String, BTreeMap<BmpCoords, IpAddr>> = BTreeMap::new();
        for row in bmp_rows {
            let name: String = row.try_get("machine_name").map_err(map_err)?;
            let cabinet: i32 = row.try_get("cabinet").map_err(map_err)?;
            let frame: i32 = row.try_get("frame").map_err(map_err)?;
            let address: String = row.try_get("address").map_err(map_err)?;
            let addr: IpAddr = address
                .parse()
                .with_context(|| format!("bad BMP address for {name}: {address}"))?;
            bmps_by_machine
                .entry(name)
                .or_default()
                .insert(BmpCoords::new(cabinet as u32, frame as u32), addr);
        }

        let mut machines = Vec::with_capacity(machine_rows.len());
        for row in machine_rows {
            let name: String = row.try_get("machine_name").map_err(map_err)?;
            let in_service: bool = row.try_get("in_service").map_err(map_err)?;
            machines.push(MachineDesc {
                bmps: bmps_by_machine.remove(&name).unwrap_or_default(),
                name,
                in_service,
            });
        }
        Ok(machines)
    }

    // ── Startup recovery ──

    async fn clear_stale_in_progress(&self) -> StoreResult<u64> {
        let updated =
            sqlx::query("UPDATE pending_changes SET in_progress = FALSE WHERE in_progress")
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        Ok(updated.rows_affected())
    }

    // ── Taking work ──

    async fn jobs_with_pending_changes(&self, machine: &str) -> StoreResult<Vec<JobId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT c.job_id FROM pending_changes c \
             JOIN boards b ON b.board_id = c.board_id \
             WHERE b.machine_name = $1 AND NOT c.in_progress \
             ORDER BY c.job_id",
        )
        .bind(machine)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        rows.into_iter()
            .map(|r| r.try_get::<JobId, _>("job_id").map_err(map_err))
            .collect()
    }

    async fn take_changes_for_job(&self, job: JobId) -> StoreResult<Vec<ChangeRow>> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query(
            "SELECT c.change_id, c.job_id, c.board_id, c.from_state, c.to_state, c.power, \
                    c.keep_n, c.keep_ne, c.keep_e, c.keep_s, c.keep_sw, c.keep_w, \
                    b.cabinet, b.frame, b.board_num, b.address, b.board_power \
             FROM pending_changes c \
             JOIN boards b ON b.board_id = c.board_id \
             WHERE c.job_id = $1 AND NOT c.in_progress \
             ORDER BY c.change_id \
             FOR UPDATE OF c",
        )
        .bind(job)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;

        let mut taken = Vec::with_capacity(rows.len());
        for row in rows {
            let cabinet: i32 = row.try_get("cabinet").map_err(map_err)?;
            let frame: i32 = row.try_get("frame").map_err(map_err)?;
            let board_num: i16 = row.try_get("board_num").map_err(map_err)?;
            taken.push(ChangeRow {
                change_id: row.try_get("change_id").map_err(map_err)?,
                job_id: row.try_get("job_id").map_err(map_err)?,
                board_id: row.try_get("board_id").map_err(map_err)?,
                bmp: BmpCoords::new(cabinet as u32, frame as u32),
                board_number: board_num as BoardNumber,
                from_state: JobState::from_i16(row.try_get("from_state").map_err(map_err)?),
                to_state: JobState::from_i16(row.try_get("to_state").map_err(map_err)?),
                power_on: row.try_get("power").map_err(map_err)?,
                current_power: row.try_get("board_power").map_err(map_err)?,
                links: link_flags_from_row(&row).map_err(map_err)?,
                in_progress: true,
                board_address: parse_address(row.try_get("address").map_err(map_err)?),
            });
        }

        if !taken.is_empty() {
            let ids: Vec<ChangeId> = taken.iter().map(|c| c.change_id).collect();
            sqlx::query("UPDATE pending_changes SET in_progress = TRUE WHERE change_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(taken)
    }

    async fn pending_blacklist_ops(&self) -> StoreResult<Vec<BlacklistOpRow>> {
        let rows = sqlx::query(
            "SELECT o.op_id, o.board_id, o.op, o.data, \
                    b.machine_name, b.cabinet, b.frame, b.board_num, b.bmp_serial_id \
             FROM blacklist_ops o \
             JOIN boards b ON b.board_id = o.board_id \
             WHERE NOT o.completed AND o.failure IS NULL \
             ORDER BY o.op_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            let op_id: OpId = row.try_get("op_id").map_err(map_err)?;
            let kind_code: i16 = row.try_get("op").map_err(map_err)?;
            let Some(kind) = BlacklistOpKind::from_i16(kind_code) else {
                tracing::error!(op_id, kind_code, "unknown blacklist op kind, skipping");
                continue;
            };
            let cabinet: i32 = row.try_get("cabinet").map_err(map_err)?;
            let frame: i32 = row.try_get("frame").map_err(map_err)?;
            let board_num: i16 = row.try_get("board_num").map_err(map_err)?;
            let payload = row
                .try_get::<Option<serde_json::Value>, _>("data")
                .map_err(map_err)?
                .map(serde_json::from_value)
                .transpose()
                .with_context(|| format!("bad blacklist payload on op {op_id}"))?;
            ops.push(BlacklistOpRow {
                op_id,
                board_id: row.try_get("board_id").map_err(map_err)?,
                machine: row.try_get("machine_name").map_err(map_err)?,
                bmp: BmpCoords::new(cabinet as u32, frame as u32),
                board_number: board_num as BoardNumber,
                kind,
                expected_serial: row.try_get("bmp_serial_id").map_err(map_err)?,
                payload,
            });
        }
        Ok(ops)
    }

    async fn finish_zero_change(
        &self,
        job: JobId,
        to: JobState,
        changes: &[ChangeId],
    ) -> StoreResult<bool> {
        let mut tx = self.begin().await?;
        let deleted = sqlx::query("DELETE FROM pending_changes WHERE change_id = ANY($1)")
            .bind(changes)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        let state_changed = Self::set_job_state(&mut tx, job, to).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(deleted.rows_affected() > 0 || state_changed)
    }

    // ── Applying power outcomes ──

    async fn power_succeeded(
        &self,
        job: JobId,
        to: JobState,
        on_boards: &[BoardId],
        off_boards: &[BoardId],
        changes: &[ChangeId],
    ) -> StoreResult<bool> {
        let mut tx = self.begin().await?;
        let mut changed = false;

        if !on_boards.is_empty() {
            let flipped = sqlx::query(
                "SELECT count(*) AS n FROM boards WHERE board_id = ANY($1) AND NOT board_power",
            )
            .bind(on_boards)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
            changed |= flipped.try_get::<i64, _>("n").map_err(map_err)? > 0;
            sqlx::query(
                "UPDATE boards SET board_power = TRUE, last_power_on = now() \
                 WHERE board_id = ANY($1)",
            )
            .bind(on_boards)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }
        if !off_boards.is_empty() {
            let flipped = sqlx::query(
                "SELECT count(*) AS n FROM boards WHERE board_id = ANY($1) AND board_power",
            )
            .bind(off_boards)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
            changed |= flipped.try_get::<i64, _>("n").map_err(map_err)? > 0;
            sqlx::query(
                "UPDATE boards SET board_power = FALSE, last_power_off = now() \
                 WHERE board_id = ANY($1)",
            )
            .bind(off_boards)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        }

        changed |= Self::set_job_state(&mut tx, job, to).await?;
        if to == JobState::Destroyed {
            Self::deallocate_job(&mut tx, job).await?;
        }

        let deleted = sqlx::query("DELETE FROM pending_changes WHERE change_id = ANY($1)")
            .bind(changes)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        changed |= deleted.rows_affected() > 0;

        tx.commit().await.map_err(map_err)?;
        Ok(changed)
    }

    async fn power_failed(
        &self,
        job: JobId,
        from: JobState,
        changes: &[ChangeId],
    ) -> StoreResult<bool> {
        let mut tx = self.begin().await?;
        let reset = sqlx::query(
            "UPDATE pending_changes SET in_progress = FALSE \
             WHERE change_id = ANY($1) AND in_progress",
        )
        .bind(changes)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        let state_changed = Self::set_job_state(&mut tx, job, from).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(reset.rows_affected() > 0 || state_changed)
    }

    async fn quarantine_board(
        &self,
        job: JobId,
        board: BoardId,
        reporter: &str,
    ) -> StoreResult<bool> {
        let mut tx = self.begin().await?;
        let mut changed = Self::set_job_state(&mut tx, job, JobState::Queued).await?;
        Self::deallocate_job(&mut tx, job).await?;
        let deleted = sqlx::query("DELETE FROM pending_changes WHERE job_id = $1")
            .bind(job)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        changed |= deleted.rows_affected() > 0;
        changed |= Self::mark_dead(
            &mut tx,
            board,
            reporter,
            "board was not reachable when powering on: taking out of service",
        )
        .await?;
        tx.commit().await.map_err(map_err)?;
        Ok(changed)
    }

    async fn take_out_of_service(&self, board: BoardId, reporter: &str) -> StoreResult<bool> {
        let mut tx = self.begin().await?;
        let changed = Self::mark_dead(
            &mut tx,
            board,
            reporter,
            "board persistently failed blacklist access: taking out of service",
        )
        .await?;
        tx.commit().await.map_err(map_err)?;
        Ok(changed)
    }

    // ── Applying blacklist outcomes ──

    async fn blacklist_read_done(
        &self,
        op: OpId,
        board: BoardId,
        blacklist: &Blacklist,
        bmp_serial: &str,
        physical_serial: Option<&str>,
    ) -> StoreResult<()> {
        let result =
            serde_json::to_value(blacklist).context("failed to serialize blacklist")?;
        let mut tx = self.begin().await?;
        sqlx::query(
            "UPDATE boards SET bmp_serial_id = $2, \
                    physical_serial_id = COALESCE($3, physical_serial_id) \
             WHERE board_id = $1",
        )
        .bind(board)
        .bind(bmp_serial)
        .bind(physical_serial)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        sqlx::query("UPDATE blacklist_ops SET completed = TRUE, result = $2 WHERE op_id = $1")
            .bind(op)
            .bind(result)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn blacklist_write_done(&self, op: OpId) -> StoreResult<()> {
        sqlx::query("UPDATE blacklist_ops SET completed = TRUE WHERE op_id = $1")
            .bind(op)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn serial_read_done(
        &self,
        op: OpId,
        board: BoardId,
        bmp_serial: &str,
        physical_serial: Option<&str>,
    ) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            "UPDATE boards SET bmp_serial_id = $2, \
                    physical_serial_id = COALESCE($3, physical_serial_id) \
             WHERE board_id = $1",
        )
        .bind(board)
        .bind(bmp_serial)
        .bind(physical_serial)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        sqlx::query("UPDATE blacklist_ops SET completed = TRUE WHERE op_id = $1")
            .bind(op)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn blacklist_op_failed(&self, op: OpId, message: &str) -> StoreResult<()> {
        sqlx::query("UPDATE blacklist_ops SET failure = $2 WHERE op_id = $1")
            .bind(op)
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    // ── Management / inspection ──

    async fn pending_change_count(&self) -> StoreResult<u64> {
        let row = sqlx::query("SELECT count(*) AS n FROM pending_changes WHERE NOT in_progress")
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(row.try_get::<i64, _>("n").map_err(map_err)? as u64)
    }

    async fn board(&self, board: BoardId) -> StoreResult<Option<BoardRecord>> {
        let row = sqlx::query(
            "SELECT board_id, machine_name, x, y, z, cabinet, frame, board_num, address, \
                    board_power, functioning, allocated_job, bmp_serial_id, \
                    physical_serial_id, last_power_on, last_power_off \
             FROM boards WHERE board_id = $1",
        )
        .bind(board)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let x: i32 = row.try_get("x").map_err(map_err)?;
        let y: i32 = row.try_get("y").map_err(map_err)?;
        let z: i32 = row.try_get("z").map_err(map_err)?;
        let cabinet: i32 = row.try_get("cabinet").map_err(map_err)?;
        let frame: i32 = row.try_get("frame").map_err(map_err)?;
        let board_num: i16 = row.try_get("board_num").map_err(map_err)?;
        Ok(Some(BoardRecord {
            board_id: row.try_get("board_id").map_err(map_err)?,
            machine: row.try_get("machine_name").map_err(map_err)?,
            triad: TriadCoords {
                x: x as u32,
                y: y as u32,
                z: z as u32,
            },
            bmp: BmpCoords::new(cabinet as u32, frame as u32),
            board_number: board_num as BoardNumber,
            address: parse_address(row.try_get("address").map_err(map_err)?),
            power: row.try_get("board_power").map_err(map_err)?,
            functioning: row.try_get("functioning").map_err(map_err)?,
            allocated_to: row.try_get("allocated_job").map_err(map_err)?,
            bmp_serial: row.try_get("bmp_serial_id").map_err(map_err)?,
            physical_serial: row.try_get("physical_serial_id").map_err(map_err)?,
            last_power_on: epoch_ms(row.try_get("last_power_on").map_err(map_err)?),
            last_power_off: epoch_ms(row.try_get("last_power_off").map_err(map_err)?),
        }))
    }

    async fn job_state(&self, job: JobId) -> StoreResult<Option<JobState>> {
        let row = sqlx::query("SELECT job_state FROM jobs WHERE job_id = $1")
            .bind(job)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(row
            .map(|r| r.try_get::<i16, _>("job_state").map(JobState::from_i16))
            .transpose()
            .map_err(map_err)?)
    }

    async fn board_reports(&self, board: BoardId) -> StoreResult<Vec<BoardReport>> {
        let rows = sqlx::query(
            "SELECT board_id, reporter, reported_issue, report_timestamp \
             FROM board_reports WHERE board_id = $1 ORDER BY report_id",
        )
        .bind(board)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        let mut reports = Vec::with_capacity(rows.len());
        for row in rows {
            let ts: chrono::DateTime<chrono::Utc> =
                row.try_get("report_timestamp").map_err(map_err)?;
            reports.push(BoardReport {
                board_id: row.try_get("board_id").map_err(map_err)?,
                reporter: row.try_get("reporter").map_err(map_err)?,
                issue: row.try_get("reported_issue").map_err(map_err)?,
                timestamp: ts.timestamp_millis(),
            });
        }
        Ok(reports)
    }
}
