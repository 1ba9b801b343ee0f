mod common;

use holdback::error::HoldbackError;
use holdback::model::tables::{CATEGORIES, CATEGORY_DATA, CATEGORY_DATA_VALUES, COLUMN_DEFINITIONS};
use holdback::model::{CategoryBoard, CategoryKind, MAX_SECTION_COLUMNS};

use common::{backend, options, past_window, settle, store};

#[tokio::test(start_paused = true)]
async fn test_new_section_is_complete_and_expanded() {
    let store = store();
    let board = CategoryBoard::open(backend(&store), CategoryKind::Construction, options())
        .await
        .unwrap();

    let id = board.add_section(None).await.unwrap();
    settle().await;

    let section = board.section(id).unwrap();
    assert_eq!(section.header, "New Section");
    assert_eq!(section.columns.len(), 1);
    assert_eq!(section.columns[0].name, "Column 1");
    assert_eq!(section.rows.len(), 1);
    assert_eq!(section.rows[0].row_number, 1);
    assert_eq!(section.rows[0].cells.len(), 1);
    assert!(section.rows[0].cells[0].id.is_some());
    assert!(board.is_expanded(id));
    assert!(!board.toggle_expanded(id));
    assert!(!board.is_expanded(id));

    assert_eq!(board.view().refetch_count(), 0);
    assert_eq!(board.view().outstanding_echoes(), 0);

    // A fresh read agrees with the optimistic state
    assert!(board.view().reconcile().await);
    assert_eq!(board.section(id).unwrap(), section);
}

#[tokio::test(start_paused = true)]
async fn test_kinds_do_not_mix() {
    let store = store();
    let construction = CategoryBoard::open(backend(&store), CategoryKind::Construction, options())
        .await
        .unwrap();
    let inspection = CategoryBoard::open(backend(&store), CategoryKind::Inspection, options())
        .await
        .unwrap();

    inspection.add_section(Some("Fire doors")).await.unwrap();
    settle().await;

    assert!(construction.sections().is_empty());
    assert!(construction.view().refetch_count() >= 1);
    assert_eq!(inspection.sections().len(), 1);
    assert_eq!(inspection.sections()[0].header, "Fire doors");
}

#[tokio::test(start_paused = true)]
async fn test_column_limit_and_last_column() {
    let store = store();
    let board = CategoryBoard::open(backend(&store), CategoryKind::Construction, options())
        .await
        .unwrap();
    let id = board.add_section(Some("Roofing")).await.unwrap();

    assert!(matches!(
        board.delete_column(id).await,
        Err(HoldbackError::LastColumn)
    ));

    board.add_row(id).await.unwrap();
    for _ in 1..MAX_SECTION_COLUMNS {
        board.add_column(id).await.unwrap();
    }
    assert!(matches!(
        board.add_column(id).await,
        Err(HoldbackError::ColumnLimit(3))
    ));

    let section = board.section(id).unwrap();
    assert_eq!(section.columns.len(), 3);
    let orders: Vec<i64> = section.columns.iter().map(|c| c.order).collect();
    assert_eq!(orders, vec![1, 2, 3]);
    for row in &section.rows {
        assert_eq!(row.cells.len(), 3);
        assert!(row.cells.iter().all(|c| c.id.is_some()));
    }
    assert_eq!(store.row_count(CATEGORY_DATA_VALUES), 6);

    let last = section.columns[2].id;
    board.delete_column(id).await.unwrap();
    settle().await;

    let section = board.section(id).unwrap();
    assert_eq!(section.columns.len(), 2);
    assert!(section.columns.iter().all(|c| c.id != last));
    assert_eq!(store.row_count(CATEGORY_DATA_VALUES), 4);
    assert_eq!(board.view().refetch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rows_number_after_the_last() {
    let store = store();
    let board = CategoryBoard::open(backend(&store), CategoryKind::Inspection, options())
        .await
        .unwrap();
    let id = board.add_section(None).await.unwrap();

    let second = board.add_row(id).await.unwrap();
    board.add_row(id).await.unwrap();
    board.delete_row(id, second).await.unwrap();
    let fourth = board.add_row(id).await.unwrap();
    settle().await;

    let numbers: Vec<i64> = board
        .section(id)
        .unwrap()
        .rows
        .iter()
        .map(|r| r.row_number)
        .collect();
    assert_eq!(numbers, vec![1, 3, 4]);
    assert_eq!(store.get(CATEGORY_DATA, fourth).unwrap()["row_number"], 4);
    assert_eq!(store.row_count(CATEGORY_DATA_VALUES), 3);
    assert_eq!(board.view().refetch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delete_section_cascades() {
    let store = store();
    let board = CategoryBoard::open(backend(&store), CategoryKind::Construction, options())
        .await
        .unwrap();
    let id = board.add_section(None).await.unwrap();
    board.add_row(id).await.unwrap();
    board.add_column(id).await.unwrap();

    board.delete_section(id).await.unwrap();
    settle().await;

    assert!(board.sections().is_empty());
    for table in [CATEGORIES, COLUMN_DEFINITIONS, CATEGORY_DATA, CATEGORY_DATA_VALUES] {
        assert_eq!(store.row_count(table), 0, "{table} should be empty");
    }
    assert_eq!(board.view().refetch_count(), 0);
    assert_eq!(board.view().outstanding_echoes(), 0);
    assert!(matches!(
        board.delete_section(id).await,
        Err(HoldbackError::SectionNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_renames_and_cell_edits_reach_the_store() {
    let store = store();
    let board = CategoryBoard::open(backend(&store), CategoryKind::Construction, options())
        .await
        .unwrap();
    let observer = CategoryBoard::open(backend(&store), CategoryKind::Construction, options())
        .await
        .unwrap();
    let id = board.add_section(None).await.unwrap();
    let section = board.section(id).unwrap();
    let column = section.columns[0].id;
    let cell = section.rows[0].cells[0].id.unwrap();

    board.rename_section(id, "Scaff").unwrap();
    board.rename_section(id, "Scaffolding").unwrap();
    board.rename_column(column, "Item").unwrap();
    board.update_cell(cell, "Tower 3").unwrap();
    past_window().await;

    assert_eq!(store.get(CATEGORIES, id).unwrap()["header"], "Scaffolding");
    assert_eq!(store.get(COLUMN_DEFINITIONS, column).unwrap()["column_name"], "Item");
    assert_eq!(store.get(CATEGORY_DATA_VALUES, cell).unwrap()["value"], "Tower 3");
    let header_writes = store
        .updates()
        .iter()
        .filter(|w| w.table == CATEGORIES)
        .count();
    assert_eq!(header_writes, 1);

    let seen = observer.section(id).unwrap();
    assert_eq!(seen.header, "Scaffolding");
    assert_eq!(seen.columns[0].name, "Item");
    assert_eq!(seen.rows[0].cells[0].value, "Tower 3");
    assert_eq!(board.view().refetch_count(), 0);
}
